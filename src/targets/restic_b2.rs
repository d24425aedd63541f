//! restic backups to a Backblaze B2 bucket.

use serde_yaml::Mapping;
use tracing::info;

use super::b2::B2Settings;
use super::restic::{ResticRepo, ResticSettings};
use super::{RunOutcome, TargetConfig, TargetError, Tool};
use crate::command::Invocation;
use crate::config::{ConfigError, Configuration};

#[derive(Debug, Clone, PartialEq)]
pub struct ResticB2Settings {
    pub b2: B2Settings,
    pub restic: ResticSettings,
}

impl ResticB2Settings {
    pub fn normalize(name: &str, entry: &Mapping) -> Result<Self, ConfigError> {
        Ok(Self {
            b2: B2Settings::normalize(name, entry)?,
            restic: ResticSettings::normalize(name, entry)?,
        })
    }
}

#[derive(Debug)]
pub struct ResticB2 {
    name: String,
    b2: B2Settings,
    repo: ResticRepo,
}

impl ResticB2 {
    pub(crate) fn new(
        config: &TargetConfig,
        settings: &ResticB2Settings,
        bandwidth_limit: Option<u64>,
        conf: &Configuration,
    ) -> Result<Self, ConfigError> {
        let restic = Tool::from_registry(conf.tools(), "restic")?;
        Ok(Self {
            name: config.name.clone(),
            b2: settings.b2.clone(),
            repo: ResticRepo::new(restic, &settings.restic, config, bandwidth_limit),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `b2:<bucket>:<path>`
    pub fn repository(&self) -> String {
        format!("b2:{}:{}", self.b2.bucket, self.b2.path)
    }

    /// Reachability is left to restic.
    pub fn available(&self) -> bool {
        true
    }

    pub fn backup_command(&self) -> Result<Invocation, TargetError> {
        self.repo.backup_command(&self.repository(), &self.b2.env())
    }

    pub fn forget_command(&self) -> Result<Invocation, TargetError> {
        self.repo.forget_command(&self.repository(), &self.b2.env())
    }

    pub fn synchronize(&self) -> Result<RunOutcome, TargetError> {
        let invocation = self.backup_command()?;
        info!(target = %self.name, repository = %self.repository(), "restic backup");
        Ok(RunOutcome::from_status(invocation.run()?))
    }

    pub fn forget(&self) -> Result<RunOutcome, TargetError> {
        let invocation = self.forget_command()?;
        info!(target = %self.name, repository = %self.repository(), "restic forget");
        Ok(RunOutcome::from_status(invocation.run()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::Target;
    use crate::targets::test_support::{conf_with, empty_conf, target_config};
    use std::fs;
    use tempfile::TempDir;

    const ENTRY: &str = "  - {name: cloud, type: restic-b2, bucket: bucket, path: host/data, id: the-id, key: the-key, password: pw, includes: [/home], io_class: null, cpu_priority: null}\n";

    fn target(conf: &Configuration) -> ResticB2 {
        match Target::from_config(&target_config(ENTRY), conf).unwrap() {
            Target::ResticB2(t) => t,
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_repository_and_credentials() {
        let tmp = TempDir::new().unwrap();
        let restic = tmp.path().join("restic");
        fs::write(&restic, "").unwrap();
        let target = target(&conf_with(tmp.path(), None, &[("restic", restic.clone())]));

        assert_eq!(target.repository(), "b2:bucket:host/data");
        assert!(target.available());

        let inv = target.backup_command().unwrap();
        assert_eq!(inv.argv()[1..4], ["-r", "b2:bucket:host/data", "backup"]);
        assert_eq!(inv.env().get("B2_ACCOUNT_ID").unwrap(), "the-id");
        assert_eq!(inv.env().get("B2_ACCOUNT_KEY").unwrap(), "the-key");
        assert!(!inv.argv().iter().any(|a| a.contains("the-key")));
    }

    #[test]
    fn test_missing_restic_fails_explicitly() {
        let tmp = TempDir::new().unwrap();
        let target = target(&empty_conf(tmp.path()));
        assert!(target.available());
        assert!(matches!(
            target.synchronize(),
            Err(TargetError::Tool { tool, .. }) if tool == "restic"
        ));
    }
}
