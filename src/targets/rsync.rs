//! Mirroring of a local directory to a remote one with rsync over SSH.

use std::path::PathBuf;

use serde::Deserialize;
use serde_yaml::Mapping;
use tracing::info;

use super::ssh::{SshSettings, SshTransport};
use super::{RunOutcome, TargetConfig, TargetError, Tool, decode, limit_kb, require, scalar};
use crate::command::{CommandBuilder, Invocation, ResourcePolicy};
use crate::config::{ConfigError, Configuration};
use crate::ssh::SshError;

#[derive(Debug, Clone, PartialEq)]
pub struct RsyncSettings {
    pub ssh: SshSettings,
    pub source: PathBuf,
    pub target: String,
    pub filters: Vec<String>,
    pub one_filesystem: bool,
}

#[derive(Deserialize)]
struct RawRsync {
    source: Option<PathBuf>,
    #[serde(default, deserialize_with = "scalar")]
    target: Option<String>,
    #[serde(default)]
    filters: Vec<String>,
    #[serde(default, alias = "one_file_system")]
    one_filesystem: bool,
}

impl RsyncSettings {
    pub fn normalize(name: &str, entry: &Mapping) -> Result<Self, ConfigError> {
        let ssh = SshSettings::normalize(name, entry)?;
        let raw: RawRsync = decode(name, entry)?;
        Ok(Self {
            ssh,
            source: require(raw.source, "source", name)?,
            target: require(raw.target, "target", name)?,
            filters: raw.filters,
            one_filesystem: raw.one_filesystem,
        })
    }
}

#[derive(Debug)]
pub struct Rsync {
    name: String,
    settings: RsyncSettings,
    ssh: SshTransport,
    rsync: Tool,
    resources: ResourcePolicy,
    bandwidth_limit: Option<u64>,
}

impl Rsync {
    pub(crate) fn new(
        config: &TargetConfig,
        settings: &RsyncSettings,
        bandwidth_limit: Option<u64>,
        conf: &Configuration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: config.name.clone(),
            settings: settings.clone(),
            ssh: SshTransport::new(&config.name, &settings.ssh, conf)?,
            rsync: Tool::on_search_path("rsync"),
            resources: config.resources,
            bandwidth_limit,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ssh(&self) -> &SshTransport {
        &self.ssh
    }

    pub(crate) fn map_ssh(mut self, f: impl FnOnce(SshTransport) -> SshTransport) -> Self {
        self.ssh = f(self.ssh);
        self
    }

    #[cfg(test)]
    fn with_rsync(mut self, path: &std::path::Path) -> Self {
        self.rsync = Tool {
            name: "rsync",
            path: path.to_path_buf(),
            available: true,
        };
        self
    }

    pub fn describe(&self) -> String {
        format!(
            "{} -> {}@{}:{}",
            self.settings.source.display(),
            self.ssh.username(),
            self.ssh.host(),
            self.settings.target
        )
    }

    pub fn available(&self) -> Result<bool, SshError> {
        self.ssh.available()
    }

    pub fn sync_command(&self, alias: &str) -> Result<Invocation, TargetError> {
        let mut builder = CommandBuilder::new(self.rsync.require()?)
            .resources(&self.resources)
            .args(["-a", "--delete-during", "--delete-excluded"]);
        for filter in &self.settings.filters {
            builder = builder.arg(format!("--filter={filter}"));
        }
        if self.settings.one_filesystem {
            builder = builder.arg("--one-file-system");
        }
        if let Some(limit) = self.bandwidth_limit {
            builder = builder.arg(format!("--bwlimit={}", limit_kb(limit)));
        }
        Ok(builder
            .arg(&self.settings.source)
            .arg(format!("{alias}:{}", self.settings.target))
            .build())
    }

    pub fn synchronize(&self) -> Result<RunOutcome, TargetError> {
        self.ssh.run_in_session(|alias| {
            let invocation = self.sync_command(alias)?;
            info!(target = %self.name, host = %self.ssh.host(), "rsync");
            Ok(RunOutcome::from_status(invocation.run()?))
        })
    }
}
