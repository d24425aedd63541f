//! Service configuration.
//!
//! The configuration lives in `<conf-dir>/conf.yml`:
//!
//! ```yaml
//! period: 3600              # seconds between automatic passes
//! bandwidth_limit: 1M       # bytes/s, k/M/G suffixes allowed
//!
//! tools:                    # bare names are looked up in PATH
//!   restic: /opt/restic
//!   rclone: rclone
//!
//! auto_update:
//!   restic-service: false
//!   restic: true
//!
//! targets:
//!   - name: nas
//!     type: restic-sftp
//!     host: nas.lan
//!     username: backup
//!     path: /srv/restic
//!     password: secret
//!     includes: [/home]
//! ```
//!
//! Loading happens in two steps. [`normalize`] is a pure function from the
//! deserialized [`RawConfig`] to a validated [`NormalizedConfig`]: defaults
//! are filled in, every target gets a name and a known type, names are
//! unique, and each target type checks its own fields.
//! [`Configuration::from_normalized`] then resolves tool paths and builds one
//! [`Target`] per entry.

pub mod bandwidth;
pub mod tools;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::ssh::SshError;
use crate::targets::{Target, TargetConfig, TargetKind};

pub use bandwidth::{BandwidthSpec, parse_bandwidth_limit};
pub use tools::{KNOWN_TOOLS, ToolEntry, ToolRegistry};

/// Default polling period, in seconds.
pub const DEFAULT_PERIOD: u64 = 3600;

/// Default configuration directory.
pub const DEFAULT_CONF_DIR: &str = "/etc/restic-service";

/// Name of the configuration file inside the configuration directory.
pub const CONF_FILE_NAME: &str = "conf.yml";

/// Errors raised while loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("missing '{field}' field in target{}", describe_target(.target))]
    MissingField {
        field: &'static str,
        target: Option<String>,
    },

    #[error("target type {} does not exist, available targets: {}", .0, TargetKind::known_types())]
    UnknownTargetType(String),

    #[error(
        "invalid target name '{0}', use letters, digits, '.', '_' and '-' and do not start with '.'"
    )]
    InvalidTargetName(String),

    #[error("duplicate target name '{0}'")]
    DuplicateTarget(String),

    #[error(
        "cannot interpret '{0}' as a valid bandwidth limit, give a plain number in bytes or use the k, M and G suffixes"
    )]
    InvalidBandwidthLimit(String),

    #[error("invalid target '{name}': {source}")]
    InvalidTarget {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid '{field}' in target '{target}': {message}")]
    InvalidValue {
        target: String,
        field: &'static str,
        message: String,
    },

    #[error("nothing to backup in target '{0}'")]
    NothingToBackup(String),

    #[error("source {path} of target '{target}' does not exist")]
    MissingSource { target: String, path: PathBuf },

    #[error("period must be a positive number of seconds")]
    InvalidPeriod,

    #[error("unknown tool '{}', known tools: {}", .0, KNOWN_TOOLS.join(", "))]
    UnknownTool(String),

    #[error("cannot find '{tool}' (configured as {path})")]
    ToolUnavailable { tool: String, path: PathBuf },

    #[error("no target named '{0}'")]
    NoSuchTarget(String),

    #[error("cannot load pinned keys of target '{target}': {source}")]
    Keys {
        target: String,
        #[source]
        source: SshError,
    },
}

fn describe_target(target: &Option<String>) -> String {
    match target {
        Some(name) => format!(" '{name}'"),
        None => String::new(),
    }
}

// =============================================================================
// Raw and normalized forms
// =============================================================================

/// Per-tool auto-update toggles.
///
/// These are read by the external updater; the orchestration engine only
/// reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoUpdate {
    #[serde(rename = "restic-service")]
    pub restic_service: bool,
    pub restic: bool,
    pub rclone: bool,
}

/// The configuration file as deserialized, before validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub period: Option<u64>,
    pub bandwidth_limit: Option<BandwidthSpec>,
    pub tools: BTreeMap<String, String>,
    pub auto_update: AutoUpdate,
    pub targets: Vec<Mapping>,
}

impl RawConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes to null
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_yaml::from_str(text)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(value)
    }
}

/// A validated configuration, with defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedConfig {
    pub period: u64,
    pub bandwidth_limit: Option<u64>,
    /// Configured value for every known tool.
    pub tools: BTreeMap<String, String>,
    pub auto_update: AutoUpdate,
    pub targets: Vec<TargetConfig>,
}

impl Default for NormalizedConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            bandwidth_limit: None,
            tools: KNOWN_TOOLS
                .iter()
                .map(|t| (t.to_string(), t.to_string()))
                .collect(),
            auto_update: AutoUpdate::default(),
            targets: Vec::new(),
        }
    }
}

/// String form of a YAML scalar. Non-scalars and null yield `None`.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Target names end up in SSH aliases and key file names.
fn is_valid_target_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Validate a raw configuration and fill in defaults.
///
/// Fails on the first problem found; nothing is partially accepted.
pub fn normalize(raw: &RawConfig) -> Result<NormalizedConfig, ConfigError> {
    let period = raw.period.unwrap_or(DEFAULT_PERIOD);
    if period == 0 {
        return Err(ConfigError::InvalidPeriod);
    }

    let bandwidth_limit = raw
        .bandwidth_limit
        .as_ref()
        .map(BandwidthSpec::to_bytes)
        .transpose()?;

    if let Some(unknown) = raw.tools.keys().find(|t| !KNOWN_TOOLS.contains(&t.as_str())) {
        return Err(ConfigError::UnknownTool(unknown.clone()));
    }
    let tools = KNOWN_TOOLS
        .iter()
        .map(|&tool| {
            let value = raw.tools.get(tool).cloned().unwrap_or_else(|| tool.to_string());
            (tool.to_string(), value)
        })
        .collect();

    let mut names = HashSet::new();
    let mut targets = Vec::with_capacity(raw.targets.len());
    for entry in &raw.targets {
        let name = entry
            .get("name")
            .and_then(scalar_to_string)
            .ok_or(ConfigError::MissingField {
                field: "name",
                target: None,
            })?;
        if !is_valid_target_name(&name) {
            return Err(ConfigError::InvalidTargetName(name));
        }
        let kind: TargetKind = entry
            .get("type")
            .and_then(scalar_to_string)
            .ok_or_else(|| ConfigError::MissingField {
                field: "type",
                target: Some(name.clone()),
            })?
            .parse()?;

        if !names.insert(name.clone()) {
            return Err(ConfigError::DuplicateTarget(name));
        }
        targets.push(TargetConfig::normalize(&name, kind, entry)?);
    }

    Ok(NormalizedConfig {
        period,
        bandwidth_limit,
        tools,
        auto_update: raw.auto_update,
        targets,
    })
}

// =============================================================================
// Configuration
// =============================================================================

/// A loaded configuration: global policy plus the registered targets.
#[derive(Debug)]
pub struct Configuration {
    conf_dir: PathBuf,
    period: u64,
    bandwidth_limit: Option<u64>,
    tools: ToolRegistry,
    auto_update: AutoUpdate,
    targets: Vec<Target>,
}

impl Configuration {
    /// An empty configuration with default policy.
    pub fn empty(conf_dir: impl Into<PathBuf>) -> Self {
        let defaults = NormalizedConfig::default();
        Self {
            conf_dir: conf_dir.into(),
            period: defaults.period,
            bandwidth_limit: None,
            tools: ToolRegistry::resolve(&defaults.tools),
            auto_update: defaults.auto_update,
            targets: Vec::new(),
        }
    }

    /// Load a configuration file.
    ///
    /// A missing file is an empty configuration; an unreadable or invalid
    /// one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let conf_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if !path.is_file() {
            info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::empty(conf_dir));
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw = RawConfig::from_yaml_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        let normalized = normalize(&raw)?;
        let tools = ToolRegistry::resolve(&normalized.tools);
        Self::from_normalized(conf_dir, normalized, tools)
    }

    /// Load `conf.yml` from a configuration directory.
    pub fn load_dir(conf_dir: &Path) -> Result<Self, ConfigError> {
        Self::load(&conf_dir.join(CONF_FILE_NAME))
    }

    /// Build targets from a validated configuration.
    pub fn from_normalized(
        conf_dir: impl Into<PathBuf>,
        normalized: NormalizedConfig,
        tools: ToolRegistry,
    ) -> Result<Self, ConfigError> {
        let mut conf = Self {
            conf_dir: conf_dir.into(),
            period: normalized.period,
            bandwidth_limit: normalized.bandwidth_limit,
            tools,
            auto_update: normalized.auto_update,
            targets: Vec::new(),
        };

        let targets = normalized
            .targets
            .iter()
            .map(|config| Target::from_config(config, &conf))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = targets.len(), "registered targets");
        conf.targets = targets;
        Ok(conf)
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// Polling period between automatic passes.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }

    /// Global bandwidth limit in bytes/s.
    pub fn bandwidth_limit(&self) -> Option<u64> {
        self.bandwidth_limit
    }

    pub fn auto_update(&self) -> AutoUpdate {
        self.auto_update
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Full path of a tool; fails if it was not found at load time.
    pub fn tool_path(&self, tool: &str) -> Result<&Path, ConfigError> {
        self.tools.path(tool)
    }

    /// Configured path of a tool, even if it does not exist yet.
    pub fn tool_path_optional(&self, tool: &str) -> Result<&Path, ConfigError> {
        self.tools.path_optional(tool)
    }

    /// Pinned key file of a target.
    pub fn keys_path_for(&self, target_name: &str) -> PathBuf {
        self.conf_dir
            .join("keys")
            .join(format!("{target_name}.keys"))
    }

    /// Targets in registration order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target_by_name(&self, name: &str) -> Result<&Target, ConfigError> {
        self.targets
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ConfigError::NoSuchTarget(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
