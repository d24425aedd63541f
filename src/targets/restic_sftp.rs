//! restic backups to an SFTP server, through a pinned SSH alias.

use serde::Deserialize;
use serde_yaml::Mapping;
use tracing::info;

use super::restic::{ResticRepo, ResticSettings};
use super::ssh::{SshSettings, SshTransport};
use super::{RunOutcome, TargetConfig, TargetError, Tool, decode, require, scalar};
use crate::command::Invocation;
use crate::config::{ConfigError, Configuration};
use crate::ssh::SshError;

#[derive(Debug, Clone, PartialEq)]
pub struct ResticSftpSettings {
    pub ssh: SshSettings,
    pub path: String,
    pub restic: ResticSettings,
}

#[derive(Deserialize)]
struct RawSftp {
    #[serde(default, deserialize_with = "scalar")]
    path: Option<String>,
}

impl ResticSftpSettings {
    pub fn normalize(name: &str, entry: &Mapping) -> Result<Self, ConfigError> {
        let ssh = SshSettings::normalize(name, entry)?;
        let raw: RawSftp = decode(name, entry)?;
        Ok(Self {
            ssh,
            path: require(raw.path, "path", name)?,
            restic: ResticSettings::normalize(name, entry)?,
        })
    }
}

#[derive(Debug)]
pub struct ResticSftp {
    name: String,
    path: String,
    ssh: SshTransport,
    repo: ResticRepo,
}

impl ResticSftp {
    pub(crate) fn new(
        config: &TargetConfig,
        settings: &ResticSftpSettings,
        bandwidth_limit: Option<u64>,
        conf: &Configuration,
    ) -> Result<Self, ConfigError> {
        let restic = Tool::from_registry(conf.tools(), "restic")?;
        Ok(Self {
            name: config.name.clone(),
            path: settings.path.clone(),
            ssh: SshTransport::new(&config.name, &settings.ssh, conf)?,
            repo: ResticRepo::new(restic, &settings.restic, config, bandwidth_limit),
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

    /// `sftp:<alias>:<path>`
    pub fn repository(&self, alias: &str) -> String {
        format!("sftp:{alias}:{}", self.path)
    }

    pub fn describe(&self) -> String {
        format!(
            "sftp:{}@{}:{}",
            self.ssh.username(),
            self.ssh.host(),
            self.path
        )
    }

    pub fn available(&self) -> Result<bool, SshError> {
        self.ssh.available()
    }

    pub fn backup_command(&self, alias: &str) -> Result<Invocation, TargetError> {
        self.repo.backup_command(&self.repository(alias), &[])
    }

    pub fn forget_command(&self, alias: &str) -> Result<Invocation, TargetError> {
        self.repo.forget_command(&self.repository(alias), &[])
    }

    pub fn synchronize(&self) -> Result<RunOutcome, TargetError> {
        self.ssh.run_in_session(|alias| {
            let invocation = self.backup_command(alias)?;
            info!(target = %self.name, host = %self.ssh.host(), "restic backup");
            Ok(RunOutcome::from_status(invocation.run()?))
        })
    }

    pub fn forget(&self) -> Result<RunOutcome, TargetError> {
        self.ssh.run_in_session(|alias| {
            let invocation = self.forget_command(alias)?;
            info!(target = %self.name, host = %self.ssh.host(), "restic forget");
            Ok(RunOutcome::from_status(invocation.run()?))
        })
    }
}
