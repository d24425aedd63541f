//! Pinned SSH host keys and live key queries.
//!
//! A target's trusted keys live in `<conf-dir>/keys/<target>.keys`, one key
//! per line in known_hosts layout (`<host> <type> <data>`). Only the
//! `(type, data)` pair takes part in comparisons; the host field is ignored.
//!
//! Trust is established by an explicit pinning step (see
//! [`TrustedKeys::write_to`]) and verified on every use against the keys the
//! host currently presents.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{SshError, write_atomic};
use crate::command::CommandBuilder;

/// A host public key: algorithm and base64 data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinnedKey {
    pub key_type: String,
    pub data: String,
}

impl PinnedKey {
    pub fn new(key_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
            data: data.into(),
        }
    }

    /// Parse a `<host> <type> <data...>` line.
    ///
    /// Returns `None` for blank lines, `#` comments and lines with fewer than
    /// three fields.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut fields = line.split_whitespace();
        let _host = fields.next()?;
        let key_type = fields.next()?;
        let data: Vec<&str> = fields.collect();
        if data.is_empty() {
            return None;
        }
        Some(Self::new(key_type, data.join(" ")))
    }
}

impl fmt::Display for PinnedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key_type, self.data)
    }
}

/// Parse every key line in keyscan or key-file output.
pub fn parse_keys(text: &str) -> Vec<PinnedKey> {
    text.lines().filter_map(PinnedKey::parse_line).collect()
}

/// Outcome of comparing live keys against the pinned set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    /// At least one live key is pinned.
    Trusted,
    /// No live key is pinned.
    Untrusted,
}

impl TrustVerdict {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted)
    }
}

/// The set of keys pinned for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedKeys {
    keys: BTreeSet<PinnedKey>,
}

impl TrustedKeys {
    pub fn new(keys: impl IntoIterator<Item = PinnedKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    pub fn parse(text: &str) -> Self {
        Self::new(parse_keys(text))
    }

    /// Load a key file.
    pub fn load(path: &Path) -> Result<Self, SshError> {
        let text = fs::read_to_string(path).map_err(|source| SshError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Load a key file, treating a missing file as an empty set.
    ///
    /// An empty set never verifies, so a target without pinned keys stays
    /// unavailable until `pin-keys` is run for it.
    pub fn load_or_empty(path: &Path) -> Result<Self, SshError> {
        match Self::load(path) {
            Err(SshError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "no pinned host keys");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Write the set as a key file, one `<host> <type> <data>` line per key.
    pub fn write_to(&self, path: &Path, host: &str) -> Result<(), SshError> {
        let io_err = |source| SshError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut contents = String::new();
        for key in &self.keys {
            contents.push_str(&format!("{host} {key}\n"));
        }
        write_atomic(path, &contents, 0o644).map_err(io_err)
    }

    pub fn verify(&self, live: &[PinnedKey]) -> TrustVerdict {
        if live.iter().any(|k| self.keys.contains(k)) {
            TrustVerdict::Trusted
        } else {
            TrustVerdict::Untrusted
        }
    }

    pub fn contains(&self, key: &PinnedKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PinnedKey> {
        self.keys.iter()
    }
}

// =============================================================================
// Live key queries
// =============================================================================

/// Source of the keys a host currently presents.
pub trait HostKeyScanner: fmt::Debug + Send + Sync {
    fn scan(&self, host: &str) -> Result<Vec<PinnedKey>, SshError>;
}

/// Queries host keys with `ssh-keyscan`.
#[derive(Debug, Clone)]
pub struct Keyscan {
    program: PathBuf,
}

impl Default for Keyscan {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh-keyscan"),
        }
    }
}

impl Keyscan {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl HostKeyScanner for Keyscan {
    fn scan(&self, host: &str) -> Result<Vec<PinnedKey>, SshError> {
        let output = CommandBuilder::new(&self.program)
            .args(["-H", host])
            .build()
            .output()?;

        // keyscan reports progress as "# host:22 SSH-2.0-..." on stderr
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            if !line.starts_with('#') {
                warn!(host, "ssh-keyscan: {line}");
            }
        }

        if !output.status.success() {
            return Err(SshError::KeyscanFailed {
                host: host.to_string(),
                code: output.status.code(),
            });
        }

        let keys = parse_keys(&String::from_utf8_lossy(&output.stdout));
        debug!(host, count = keys.len(), "queried host keys");
        Ok(keys)
    }
}

/// Scanner returning a fixed key list.
#[derive(Debug, Clone, Default)]
pub struct StaticKeys(pub Vec<PinnedKey>);

impl HostKeyScanner for StaticKeys {
    fn scan(&self, _host: &str) -> Result<Vec<PinnedKey>, SshError> {
        Ok(self.0.clone())
    }
}
