//! restic backups to a local directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Mapping;
use tracing::info;

use super::restic::{ResticRepo, ResticSettings};
use super::{RunOutcome, TargetConfig, TargetError, Tool, decode, require};
use crate::command::Invocation;
use crate::config::{ConfigError, Configuration};

#[derive(Debug, Clone, PartialEq)]
pub struct ResticFileSettings {
    pub dest: PathBuf,
    pub restic: ResticSettings,
}

#[derive(Deserialize)]
struct RawFile {
    dest: Option<PathBuf>,
}

impl ResticFileSettings {
    pub fn normalize(name: &str, entry: &Mapping) -> Result<Self, ConfigError> {
        let raw: RawFile = decode(name, entry)?;
        Ok(Self {
            dest: require(raw.dest, "dest", name)?,
            restic: ResticSettings::normalize(name, entry)?,
        })
    }
}

#[derive(Debug)]
pub struct ResticFile {
    name: String,
    dest: PathBuf,
    repo: ResticRepo,
}

impl ResticFile {
    pub(crate) fn new(
        config: &TargetConfig,
        settings: &ResticFileSettings,
        bandwidth_limit: Option<u64>,
        conf: &Configuration,
    ) -> Result<Self, ConfigError> {
        let restic = Tool::from_registry(conf.tools(), "restic")?;
        Ok(Self {
            name: config.name.clone(),
            dest: settings.dest.clone(),
            repo: ResticRepo::new(restic, &settings.restic, config, bandwidth_limit),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn repository(&self) -> String {
        self.dest.display().to_string()
    }

    /// The destination must be a mounted, existing directory.
    pub fn available(&self) -> bool {
        self.dest.is_dir()
    }

    pub fn backup_command(&self) -> Result<Invocation, TargetError> {
        self.repo.backup_command(&self.repository(), &[])
    }

    pub fn forget_command(&self) -> Result<Invocation, TargetError> {
        self.repo.forget_command(&self.repository(), &[])
    }

    pub fn synchronize(&self) -> Result<RunOutcome, TargetError> {
        let invocation = self.backup_command()?;
        info!(target = %self.name, dest = %self.dest.display(), "restic backup");
        Ok(RunOutcome::from_status(invocation.run()?))
    }

    pub fn forget(&self) -> Result<RunOutcome, TargetError> {
        let invocation = self.forget_command()?;
        info!(target = %self.name, dest = %self.dest.display(), "restic forget");
        Ok(RunOutcome::from_status(invocation.run()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::Target;
    use crate::targets::test_support::{conf_with, target_config};
    use std::fs;
    use tempfile::TempDir;

    fn target(tmp: &TempDir, dest: &Path, tool: &Path) -> ResticFile {
        let entry = format!(
            "  - {{name: local, type: restic-file, dest: '{}', password: pw, includes: [/home], io_class: null, cpu_priority: null}}\n",
            dest.display()
        );
        let conf = conf_with(tmp.path(), None, &[("restic", tool.to_path_buf())]);
        match Target::from_config(&target_config(&entry), &conf).unwrap() {
            Target::ResticFile(t) => t,
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_missing_dest_field() {
        let entry: Mapping = serde_yaml::from_str("{password: pw, includes: [/home]}").unwrap();
        assert_eq!(
            ResticFileSettings::normalize("t", &entry).unwrap_err().to_string(),
            "missing 'dest' field in target 't'"
        );
    }

    #[test]
    fn test_available_iff_dest_is_directory() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("repo");
        let restic = tmp.path().join("restic");
        fs::write(&restic, "").unwrap();

        assert!(!target(&tmp, &dest, &restic).available());
        fs::create_dir(&dest).unwrap();
        assert!(target(&tmp, &dest, &restic).available());
    }

    #[test]
    fn test_repository_is_dest_path() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("repo");
        let restic = tmp.path().join("restic");
        fs::write(&restic, "").unwrap();
        let target = target(&tmp, &dest, &restic);

        let argv = target.backup_command().unwrap().argv();
        assert_eq!(argv[0], restic.display().to_string());
        assert_eq!(argv[1..4], ["-r".to_string(), dest.display().to_string(), "backup".to_string()]);
        assert!(target.forget_command().unwrap().argv().contains(&"forget".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_failure() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("repo");
        fs::create_dir(&dest).unwrap();
        let restic = tmp.path().join("restic");
        fs::write(&restic, "#!/bin/sh\nexit 3\n").unwrap();
        fs::set_permissions(&restic, fs::Permissions::from_mode(0o755)).unwrap();

        let target = target(&tmp, &dest, &restic);
        assert_eq!(
            target.synchronize().unwrap(),
            RunOutcome::Failed { code: Some(3) }
        );
    }
}
