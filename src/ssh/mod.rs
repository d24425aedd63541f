//! SSH trust-on-first-use verification and session aliases.
//!
//! # Architecture
//!
//! - **keys**: pinned host keys, key files and live queries via `ssh-keyscan`
//! - **session**: temporary `Host` entries in the SSH client configuration,
//!   bound to a target's pinned key file and removed when the session ends
//!
//! SSH-backed targets go through the same sequence on every operation:
//! query the live keys, intersect them with the pinned set, and only on a
//! match open a session alias for the external tool to connect through.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::command::CommandError;

pub mod keys;
pub mod session;

pub use keys::{HostKeyScanner, Keyscan, PinnedKey, StaticKeys, TrustVerdict, TrustedKeys};
pub use session::{SessionEntry, SshConfigFile, SshSession};

/// Errors from key files, keyscan and SSH client configuration edits.
#[derive(Error, Debug)]
pub enum SshError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("ssh-keyscan failed for {host} (exit code {code:?})")]
    KeyscanFailed { host: String, code: Option<i32> },

    #[error("{host} did not present any host key")]
    NoHostKeys { host: String },
}

/// Replace `path` with `contents` through a temporary file in the same
/// directory, so readers see either the old or the new file.
pub(crate) fn write_atomic(path: &Path, contents: &str, mode: u32) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(contents.as_bytes())?;
    set_mode(file.path(), mode)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
