//! Mirroring of a local directory to a B2 bucket with rclone.
//!
//! rclone is given a throwaway configuration file holding a single
//! `[restic-service]` remote, so credentials never appear in argv and the
//! user's own rclone configuration is never touched.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Mapping;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::b2::B2Settings;
use super::{RunOutcome, TargetConfig, TargetError, Tool, decode, require};
use crate::command::{CommandBuilder, Invocation, ResourcePolicy};
use crate::config::{ConfigError, Configuration};

/// Name of the remote defined in the generated configuration.
pub const REMOTE_NAME: &str = "restic-service";

#[derive(Debug, Clone, PartialEq)]
pub struct RcloneB2Settings {
    pub b2: B2Settings,
    pub src: PathBuf,
    pub filters: Vec<String>,
}

#[derive(Deserialize)]
struct RawRclone {
    src: Option<PathBuf>,
    #[serde(default)]
    filters: Vec<String>,
}

impl RcloneB2Settings {
    pub fn normalize(name: &str, entry: &Mapping) -> Result<Self, ConfigError> {
        let b2 = B2Settings::normalize(name, entry)?;
        let raw: RawRclone = decode(name, entry)?;
        Ok(Self {
            b2,
            src: require(raw.src, "src", name)?,
            filters: raw.filters,
        })
    }
}

#[derive(Debug)]
pub struct RcloneB2 {
    name: String,
    settings: RcloneB2Settings,
    rclone: Tool,
    resources: ResourcePolicy,
    bandwidth_limit: Option<u64>,
    conf_dir: PathBuf,
}

impl RcloneB2 {
    /// Fails if `src` does not exist.
    pub(crate) fn new(
        config: &TargetConfig,
        settings: &RcloneB2Settings,
        bandwidth_limit: Option<u64>,
        conf: &Configuration,
    ) -> Result<Self, ConfigError> {
        if !settings.src.is_dir() {
            return Err(ConfigError::MissingSource {
                target: config.name.clone(),
                path: settings.src.clone(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            settings: settings.clone(),
            rclone: Tool::from_registry(conf.tools(), "rclone")?,
            resources: config.resources,
            bandwidth_limit,
            conf_dir: conf.conf_dir().to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        self.bandwidth_limit
    }

    /// `restic-service:<bucket>/<path>`
    pub fn destination(&self) -> String {
        format!(
            "{REMOTE_NAME}:{}/{}",
            self.settings.b2.bucket, self.settings.b2.path
        )
    }

    pub fn describe(&self) -> String {
        format!(
            "{} -> b2:{}/{}",
            self.settings.src.display(),
            self.settings.b2.bucket,
            self.settings.b2.path
        )
    }

    /// Reachability is left to rclone.
    pub fn available(&self) -> bool {
        true
    }

    /// Contents of the generated rclone configuration.
    pub fn backend_config(&self) -> String {
        format!(
            "[{REMOTE_NAME}]\ntype = b2\naccount = {}\nkey = {}\nendpoint =\n",
            self.settings.b2.id, self.settings.b2.key
        )
    }

    /// Write the backend configuration to a private temporary file, removed
    /// when the returned handle is dropped.
    pub fn write_backend_config(&self) -> Result<NamedTempFile, TargetError> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("rclone-").suffix(".conf");
            b
        };
        let mut file = if self.conf_dir.is_dir() {
            builder.tempfile_in(&self.conf_dir)
        } else {
            builder.tempfile()
        }
        .map_err(|source| TargetError::Io {
            path: self.conf_dir.clone(),
            source,
        })?;

        let path = file.path().to_path_buf();
        file.write_all(self.backend_config().as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| TargetError::Io { path, source })?;
        debug!(target = %self.name, path = %file.path().display(), "wrote rclone config");
        Ok(file)
    }

    pub fn sync_command(&self, config_path: &Path) -> Result<Invocation, TargetError> {
        let mut builder = CommandBuilder::new(self.rclone.require()?)
            .resources(&self.resources)
            .args(["--transfers", "16"])
            .arg("--config")
            .arg(config_path);
        if let Some(limit) = self.bandwidth_limit {
            builder = builder.arg("--bwlimit").arg(format!("{limit}B"));
        }
        for filter in &self.settings.filters {
            builder = builder.arg("--filter").arg(filter);
        }
        Ok(builder
            .arg("sync")
            .arg(&self.settings.src)
            .arg(self.destination())
            .build())
    }

    pub fn synchronize(&self) -> Result<RunOutcome, TargetError> {
        self.rclone.require()?;
        let config = self.write_backend_config()?;
        let invocation = self.sync_command(config.path())?;
        info!(target = %self.name, destination = %self.destination(), "rclone sync");
        let status = invocation.run()?;
        Ok(RunOutcome::from_status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::Target;
    use crate::targets::test_support::{conf_with, empty_conf, target_config};
    use std::fs;
    use tempfile::TempDir;

    fn entry(src: &Path, extra: &str) -> String {
        format!(
            "  - {{name: mirror, type: rclone-b2, bucket: bucket, path: photos, id: the-id, key: the-key, src: '{}', io_class: null, cpu_priority: null{extra}}}\n",
            src.display()
        )
    }

    fn target(conf: &Configuration, entry: &str) -> RcloneB2 {
        match Target::from_config(&target_config(entry), conf).unwrap() {
            Target::RcloneB2(t) => t,
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_src_must_exist() {
        let tmp = TempDir::new().unwrap();
        let conf = empty_conf(tmp.path());
        let config = target_config(&entry(&tmp.path().join("absent"), ""));
        let err = Target::from_config(&config, &conf).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSource { .. }));
    }

    #[test]
    fn test_sync_command() {
        let tmp = TempDir::new().unwrap();
        let rclone = tmp.path().join("rclone");
        fs::write(&rclone, "").unwrap();
        let conf = conf_with(tmp.path(), Some(2_000_000), &[("rclone", rclone.clone())]);
        let target = target(&conf, &entry(tmp.path(), ", filters: ['- *.tmp', '+ **']"));

        let inv = target.sync_command(Path::new("/tmp/rclone.conf")).unwrap();
        let tool = rclone.display().to_string();
        let src = tmp.path().display().to_string();
        assert_eq!(
            inv.argv(),
            vec![
                tool.as_str(),
                "--transfers",
                "16",
                "--config",
                "/tmp/rclone.conf",
                "--bwlimit",
                "2000000B",
                "--filter",
                "- *.tmp",
                "--filter",
                "+ **",
                "sync",
                src.as_str(),
                "restic-service:bucket/photos",
            ]
        );
        assert!(!inv.argv().iter().any(|a| a.contains("the-key")));
    }

    #[test]
    fn test_backend_config_file() {
        let tmp = TempDir::new().unwrap();
        let target = target(&empty_conf(tmp.path()), &entry(tmp.path(), ""));

        let file = target.write_backend_config().unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(path.parent().unwrap(), tmp.path());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "[restic-service]\ntype = b2\naccount = the-id\nkey = the-key\nendpoint =\n"
        );
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_rclone_fails_explicitly() {
        let tmp = TempDir::new().unwrap();
        let target = target(&empty_conf(tmp.path()), &entry(tmp.path(), ""));
        assert!(matches!(
            target.synchronize(),
            Err(TargetError::Tool { tool, .. }) if tool == "rclone"
        ));
    }
}
