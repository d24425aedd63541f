//! restic invocations shared by the restic targets.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};

use super::{Tool, TargetConfig, TargetError, decode, limit_kb, require, scalar};
use crate::command::{CommandBuilder, Invocation, ResourcePolicy};
use crate::config::{ConfigError, scalar_to_string};

/// Snapshot retention passed to `restic forget`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgetPolicy {
    pub prune: bool,
    /// Values of `--keep-tag`, one flag each.
    pub tags: Vec<String>,
    pub last: Option<u32>,
    pub hourly: Option<u32>,
    pub daily: Option<u32>,
    pub weekly: Option<u32>,
    pub monthly: Option<u32>,
    pub yearly: Option<u32>,
}

impl Default for ForgetPolicy {
    fn default() -> Self {
        Self {
            prune: true,
            tags: Vec::new(),
            last: None,
            hourly: None,
            daily: None,
            weekly: None,
            monthly: None,
            yearly: None,
        }
    }
}

#[derive(Deserialize)]
struct RawForget {
    #[serde(default = "default_prune")]
    prune: bool,
    #[serde(default, deserialize_with = "scalar_or_list")]
    tags: Vec<String>,
    last: Option<u32>,
    hourly: Option<u32>,
    daily: Option<u32>,
    weekly: Option<u32>,
    monthly: Option<u32>,
    yearly: Option<u32>,
}

fn default_prune() -> bool {
    true
}

/// `tags: 3` and `tags: [daily, pinned]` are both accepted.
fn scalar_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let expected = || D::Error::custom("expected a scalar or a list of scalars");
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items
            .iter()
            .map(|item| scalar_to_string(item).ok_or_else(expected))
            .collect(),
        value => scalar_to_string(&value).map(|v| vec![v]).ok_or_else(expected),
    }
}

impl From<RawForget> for ForgetPolicy {
    fn from(raw: RawForget) -> Self {
        Self {
            prune: raw.prune,
            tags: raw.tags,
            last: raw.last,
            hourly: raw.hourly,
            daily: raw.daily,
            weekly: raw.weekly,
            monthly: raw.monthly,
            yearly: raw.yearly,
        }
    }
}

impl ForgetPolicy {
    /// Arguments following `restic forget`.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for tag in &self.tags {
            args.push("--keep-tag".to_string());
            args.push(tag.clone());
        }
        let counts = [
            ("--keep-last", self.last),
            ("--keep-hourly", self.hourly),
            ("--keep-daily", self.daily),
            ("--keep-weekly", self.weekly),
            ("--keep-monthly", self.monthly),
            ("--keep-yearly", self.yearly),
        ];
        for (flag, count) in counts {
            if let Some(count) = count {
                args.push(flag.to_string());
                args.push(count.to_string());
            }
        }
        if self.prune {
            args.push("--prune".to_string());
        }
        args
    }
}

/// Backup parameters common to every restic target.
#[derive(Clone, PartialEq, Eq)]
pub struct ResticSettings {
    pub password: String,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub one_filesystem: bool,
    pub forget: ForgetPolicy,
}

#[derive(Deserialize)]
struct RawRestic {
    #[serde(default, deserialize_with = "scalar")]
    password: Option<String>,
    #[serde(default)]
    includes: Vec<String>,
    #[serde(default)]
    excludes: Vec<String>,
    #[serde(default)]
    one_filesystem: bool,
    forget: Option<RawForget>,
}

impl ResticSettings {
    pub fn normalize(name: &str, entry: &Mapping) -> Result<Self, ConfigError> {
        let raw: RawRestic = decode(name, entry)?;
        if raw.includes.is_empty() {
            return Err(ConfigError::NothingToBackup(name.to_string()));
        }
        Ok(Self {
            password: require(raw.password, "password", name)?,
            includes: raw.includes,
            excludes: raw.excludes,
            one_filesystem: raw.one_filesystem,
            forget: raw.forget.map(ForgetPolicy::from).unwrap_or_default(),
        })
    }
}

impl fmt::Debug for ResticSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResticSettings")
            .field("password", &"<redacted>")
            .field("includes", &self.includes)
            .field("excludes", &self.excludes)
            .field("one_filesystem", &self.one_filesystem)
            .field("forget", &self.forget)
            .finish()
    }
}

/// A restic repository plus the policy to run restic against it.
#[derive(Debug, Clone)]
pub struct ResticRepo {
    restic: Tool,
    settings: ResticSettings,
    resources: ResourcePolicy,
    bandwidth_limit: Option<u64>,
}

impl ResticRepo {
    pub(crate) fn new(
        restic: Tool,
        settings: &ResticSettings,
        config: &TargetConfig,
        bandwidth_limit: Option<u64>,
    ) -> Self {
        Self {
            restic,
            settings: settings.clone(),
            resources: config.resources,
            bandwidth_limit,
        }
    }

    pub fn settings(&self) -> &ResticSettings {
        &self.settings
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        self.bandwidth_limit
    }

    fn base(&self, repository: &str, env: &[(&str, &str)]) -> Result<CommandBuilder, TargetError> {
        let mut builder = CommandBuilder::new(self.restic.require()?)
            .resources(&self.resources)
            .env("RESTIC_PASSWORD", &self.settings.password)
            .envs(env.iter().copied());
        if let Some(limit) = self.bandwidth_limit {
            let kb = limit_kb(limit).to_string();
            builder = builder
                .args(["--limit-upload", kb.as_str()])
                .args(["--limit-download", kb.as_str()]);
        }
        Ok(builder.args(["-r", repository]))
    }

    /// `restic backup` of the configured includes.
    pub fn backup_command(&self, repository: &str, env: &[(&str, &str)]) -> Result<Invocation, TargetError> {
        let mut builder = self.base(repository, env)?.arg("backup");
        if self.settings.one_filesystem {
            builder = builder.arg("--one-file-system");
        }
        Ok(builder
            .excludes(&self.settings.excludes)
            .args(&self.settings.includes)
            .build())
    }

    /// `restic forget` with the retention policy.
    pub fn forget_command(&self, repository: &str, env: &[(&str, &str)]) -> Result<Invocation, TargetError> {
        Ok(self
            .base(repository, env)?
            .arg("forget")
            .args(self.settings.forget.args())
            .build())
    }
}
