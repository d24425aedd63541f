//! Backup and synchronization targets.
//!
//! A target owns the connection and credential parameters of one
//! destination and knows how to drive the external tool for it:
//!
//! | type          | tool   | destination                          |
//! |---------------|--------|--------------------------------------|
//! | `restic-b2`   | restic | `b2:<bucket>:<path>`                 |
//! | `restic-sftp` | restic | `sftp:<alias>:<path>` over SSH       |
//! | `restic-file` | restic | local directory                      |
//! | `rclone-b2`   | rclone | `restic-service:<bucket>/<path>`     |
//! | `rsync`       | rsync  | `<alias>:<target>` over SSH          |
//!
//! Configuration entries are validated into a [`TargetConfig`] by
//! [`TargetConfig::normalize`], then turned into a [`Target`] once tool
//! paths and pinned keys are known.

pub mod b2;
pub mod rclone_b2;
pub mod restic;
pub mod restic_b2;
pub mod restic_file;
pub mod restic_sftp;
pub mod rsync;
pub mod ssh;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::command::{CommandError, IoClass, ResourcePolicy};
use crate::config::{BandwidthSpec, ConfigError, Configuration, ToolRegistry, scalar_to_string};
use crate::ssh::{HostKeyScanner, SshConfigFile, SshError, TrustedKeys};

pub use rclone_b2::{RcloneB2, RcloneB2Settings};
pub use restic::{ForgetPolicy, ResticRepo, ResticSettings};
pub use restic_b2::{ResticB2, ResticB2Settings};
pub use restic_file::{ResticFile, ResticFileSettings};
pub use restic_sftp::{ResticSftp, ResticSftpSettings};
pub use rsync::{Rsync, RsyncSettings};
pub use ssh::{SshSettings, SshTransport};

/// Errors raised while running a target's tool.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("{tool} is not available (configured as {path})")]
    Tool { tool: String, path: PathBuf },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("target '{0}' does not support forget")]
    ForgetUnsupported(String),

    #[error("target '{0}' does not connect over ssh")]
    NotSsh(String),
}

/// Result of running a tool against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// The tool exited non-zero, or was killed (`code` is `None`).
    Failed { code: Option<i32> },
    /// The host did not present a pinned key; nothing was run.
    Untrusted,
}

impl RunOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            Self::Success
        } else {
            Self::Failed {
                code: status.code(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed { code: Some(code) } => write!(f, "failed (exit code {code})"),
            Self::Failed { code: None } => write!(f, "failed (terminated by signal)"),
            Self::Untrusted => write!(f, "untrusted host"),
        }
    }
}

// =============================================================================
// Kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKind {
    ResticB2,
    ResticSftp,
    ResticFile,
    RcloneB2,
    Rsync,
}

impl TargetKind {
    pub const ALL: [TargetKind; 5] = [
        Self::ResticB2,
        Self::ResticSftp,
        Self::ResticFile,
        Self::RcloneB2,
        Self::Rsync,
    ];

    /// Name used in the `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResticB2 => "restic-b2",
            Self::ResticSftp => "restic-sftp",
            Self::ResticFile => "restic-file",
            Self::RcloneB2 => "rclone-b2",
            Self::Rsync => "rsync",
        }
    }

    /// All type names, sorted and comma-separated.
    pub fn known_types() -> String {
        let mut names: Vec<&str> = Self::ALL.iter().map(Self::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }

    pub fn supports_forget(&self) -> bool {
        matches!(self, Self::ResticB2 | Self::ResticSftp | Self::ResticFile)
    }
}

impl FromStr for TargetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownTargetType(s.to_string()))
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Normalized configuration
// =============================================================================

/// Variant-specific fields of a validated target entry.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSettings {
    ResticB2(ResticB2Settings),
    ResticSftp(ResticSftpSettings),
    ResticFile(ResticFileSettings),
    RcloneB2(RcloneB2Settings),
    Rsync(RsyncSettings),
}

/// A validated target entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    pub name: String,
    pub resources: ResourcePolicy,
    /// Per-target limit in bytes/s; overrides the global one.
    pub bandwidth_limit: Option<u64>,
    pub settings: TargetSettings,
}

#[derive(Debug, Deserialize)]
struct RawCommon {
    #[serde(default = "default_io_class")]
    io_class: Option<u8>,
    #[serde(default)]
    io_priority: u8,
    #[serde(default = "default_cpu_priority")]
    cpu_priority: Option<i8>,
    #[serde(default)]
    bandwidth_limit: Option<BandwidthSpec>,
}

fn default_io_class() -> Option<u8> {
    Some(IoClass::Idle.as_u8())
}

fn default_cpu_priority() -> Option<i8> {
    Some(19)
}

impl TargetConfig {
    /// Validate one `targets` entry whose name and type are already known.
    pub fn normalize(name: &str, kind: TargetKind, entry: &Mapping) -> Result<Self, ConfigError> {
        let common: RawCommon = decode(name, entry)?;

        let io_class = common
            .io_class
            .map(|class| {
                IoClass::from_u8(class).ok_or_else(|| invalid(name, "io_class", "expected 0 to 3"))
            })
            .transpose()?;
        if common.io_priority > 7 {
            return Err(invalid(name, "io_priority", "expected 0 to 7"));
        }
        if common.cpu_priority.is_some_and(|nice| !(-20..=19).contains(&nice)) {
            return Err(invalid(name, "cpu_priority", "expected -20 to 19"));
        }
        let bandwidth_limit = common
            .bandwidth_limit
            .as_ref()
            .map(BandwidthSpec::to_bytes)
            .transpose()?;

        let settings = match kind {
            TargetKind::ResticB2 => TargetSettings::ResticB2(ResticB2Settings::normalize(name, entry)?),
            TargetKind::ResticSftp => {
                TargetSettings::ResticSftp(ResticSftpSettings::normalize(name, entry)?)
            }
            TargetKind::ResticFile => {
                TargetSettings::ResticFile(ResticFileSettings::normalize(name, entry)?)
            }
            TargetKind::RcloneB2 => TargetSettings::RcloneB2(RcloneB2Settings::normalize(name, entry)?),
            TargetKind::Rsync => TargetSettings::Rsync(RsyncSettings::normalize(name, entry)?),
        };

        Ok(Self {
            name: name.to_string(),
            resources: ResourcePolicy {
                io_class,
                io_priority: common.io_priority,
                cpu_priority: common.cpu_priority,
            },
            bandwidth_limit,
            settings,
        })
    }

    pub fn kind(&self) -> TargetKind {
        match self.settings {
            TargetSettings::ResticB2(_) => TargetKind::ResticB2,
            TargetSettings::ResticSftp(_) => TargetKind::ResticSftp,
            TargetSettings::ResticFile(_) => TargetKind::ResticFile,
            TargetSettings::RcloneB2(_) => TargetKind::RcloneB2,
            TargetSettings::Rsync(_) => TargetKind::Rsync,
        }
    }
}

/// Deserialize a target entry into a variant's raw field struct.
pub(crate) fn decode<T: DeserializeOwned>(name: &str, entry: &Mapping) -> Result<T, ConfigError> {
    serde_yaml::from_value(Value::Mapping(entry.clone())).map_err(|source| {
        ConfigError::InvalidTarget {
            name: name.to_string(),
            source,
        }
    })
}

/// Unwrap a required field.
pub(crate) fn require<T>(value: Option<T>, field: &'static str, name: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingField {
        field,
        target: Some(name.to_string()),
    })
}

fn invalid(name: &str, field: &'static str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        target: name.to_string(),
        field,
        message: message.to_string(),
    }
}

/// Accept any YAML scalar as a string, so `password: 1234` works.
pub(crate) fn scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(&value)
            .map(Some)
            .ok_or_else(|| D::Error::custom("expected a string")),
    }
}

// =============================================================================
// Tools
// =============================================================================

/// An external program a target runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    name: &'static str,
    path: PathBuf,
    available: bool,
}

impl Tool {
    /// Look a configured tool up in the registry.
    pub(crate) fn from_registry(registry: &ToolRegistry, name: &'static str) -> Result<Self, ConfigError> {
        Ok(Self {
            name,
            path: registry.path_optional(name)?.to_path_buf(),
            available: registry.is_available(name),
        })
    }

    /// A tool found through the search path when it is spawned.
    pub(crate) fn on_search_path(name: &'static str) -> Self {
        Self {
            name,
            path: PathBuf::from(name),
            available: true,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Path to run, or an error if the tool was not found at load time.
    pub fn require(&self) -> Result<&Path, TargetError> {
        if self.available {
            Ok(&self.path)
        } else {
            Err(TargetError::Tool {
                tool: self.name.to_string(),
                path: self.path.clone(),
            })
        }
    }
}

/// Bandwidth limit in KB/s as restic and rsync expect it.
///
/// Both read 0 as "unlimited", so small limits are rounded up to 1.
pub(crate) fn limit_kb(bytes: u64) -> u64 {
    (bytes / 1000).max(1)
}

// =============================================================================
// Target
// =============================================================================

/// A configured destination.
#[derive(Debug)]
pub enum Target {
    ResticB2(ResticB2),
    ResticSftp(ResticSftp),
    ResticFile(ResticFile),
    RcloneB2(RcloneB2),
    Rsync(Rsync),
}

impl Target {
    /// Build the target for a validated entry.
    pub fn from_config(config: &TargetConfig, conf: &Configuration) -> Result<Self, ConfigError> {
        let bandwidth_limit = config.bandwidth_limit.or(conf.bandwidth_limit());
        Ok(match &config.settings {
            TargetSettings::ResticB2(s) => {
                Self::ResticB2(ResticB2::new(config, s, bandwidth_limit, conf)?)
            }
            TargetSettings::ResticSftp(s) => {
                Self::ResticSftp(ResticSftp::new(config, s, bandwidth_limit, conf)?)
            }
            TargetSettings::ResticFile(s) => {
                Self::ResticFile(ResticFile::new(config, s, bandwidth_limit, conf)?)
            }
            TargetSettings::RcloneB2(s) => {
                Self::RcloneB2(RcloneB2::new(config, s, bandwidth_limit, conf)?)
            }
            TargetSettings::Rsync(s) => Self::Rsync(Rsync::new(config, s, bandwidth_limit, conf)?),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ResticB2(t) => t.name(),
            Self::ResticSftp(t) => t.name(),
            Self::ResticFile(t) => t.name(),
            Self::RcloneB2(t) => t.name(),
            Self::Rsync(t) => t.name(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Self::ResticB2(_) => TargetKind::ResticB2,
            Self::ResticSftp(_) => TargetKind::ResticSftp,
            Self::ResticFile(_) => TargetKind::ResticFile,
            Self::RcloneB2(_) => TargetKind::RcloneB2,
            Self::Rsync(_) => TargetKind::Rsync,
        }
    }

    /// Where the data goes, without credentials.
    pub fn describe(&self) -> String {
        match self {
            Self::ResticB2(t) => t.repository(),
            Self::ResticSftp(t) => t.describe(),
            Self::ResticFile(t) => t.repository(),
            Self::RcloneB2(t) => t.describe(),
            Self::Rsync(t) => t.describe(),
        }
    }

    /// Whether the target can be reached right now.
    pub fn available(&self) -> Result<bool, TargetError> {
        match self {
            Self::ResticB2(t) => Ok(t.available()),
            Self::ResticSftp(t) => Ok(t.available()?),
            Self::ResticFile(t) => Ok(t.available()),
            Self::RcloneB2(t) => Ok(t.available()),
            Self::Rsync(t) => Ok(t.available()?),
        }
    }

    /// Copy the configured sources to the target.
    pub fn synchronize(&self) -> Result<RunOutcome, TargetError> {
        match self {
            Self::ResticB2(t) => t.synchronize(),
            Self::ResticSftp(t) => t.synchronize(),
            Self::ResticFile(t) => t.synchronize(),
            Self::RcloneB2(t) => t.synchronize(),
            Self::Rsync(t) => t.synchronize(),
        }
    }

    pub fn supports_forget(&self) -> bool {
        self.kind().supports_forget()
    }

    /// Apply the retention policy.
    pub fn forget(&self) -> Result<RunOutcome, TargetError> {
        match self {
            Self::ResticB2(t) => t.forget(),
            Self::ResticSftp(t) => t.forget(),
            Self::ResticFile(t) => t.forget(),
            Self::RcloneB2(_) | Self::Rsync(_) => {
                Err(TargetError::ForgetUnsupported(self.name().to_string()))
            }
        }
    }

    /// SSH transport of the target, if it connects over SSH.
    pub fn ssh(&self) -> Option<&SshTransport> {
        match self {
            Self::ResticSftp(t) => Some(t.ssh()),
            Self::Rsync(t) => Some(t.ssh()),
            _ => None,
        }
    }

    /// Query the host's current keys and pin them.
    pub fn pin_keys(&self) -> Result<TrustedKeys, TargetError> {
        let ssh = self
            .ssh()
            .ok_or_else(|| TargetError::NotSsh(self.name().to_string()))?;
        Ok(ssh.pin_keys()?)
    }

    /// Use another host key source. No-op for targets without SSH.
    pub fn with_scanner(self, scanner: Arc<dyn HostKeyScanner>) -> Self {
        match self {
            Self::ResticSftp(t) => Self::ResticSftp(t.map_ssh(|ssh| ssh.with_scanner(scanner))),
            Self::Rsync(t) => Self::Rsync(t.map_ssh(|ssh| ssh.with_scanner(scanner))),
            other => other,
        }
    }

    /// Use another SSH client configuration file. No-op for targets without SSH.
    pub fn with_ssh_config(self, file: SshConfigFile) -> Self {
        match self {
            Self::ResticSftp(t) => Self::ResticSftp(t.map_ssh(|ssh| ssh.with_ssh_config(file))),
            Self::Rsync(t) => Self::Rsync(t.map_ssh(|ssh| ssh.with_ssh_config(file))),
            other => other,
        }
    }
}
