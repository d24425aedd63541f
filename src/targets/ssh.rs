//! SSH transport shared by the targets that connect over SSH.
//!
//! Every operation re-verifies the host against the pinned keys and runs the
//! tool through a temporary alias that is removed again afterwards, whatever
//! the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_yaml::Mapping;
use tracing::{info, warn};

use super::{RunOutcome, TargetError, decode, require, scalar};
use crate::config::{ConfigError, Configuration};
use crate::ssh::session::alias_for;
use crate::ssh::{
    HostKeyScanner, Keyscan, SessionEntry, SshConfigFile, SshError, TrustVerdict, TrustedKeys,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub host: String,
    pub username: String,
}

#[derive(Deserialize)]
struct RawSsh {
    #[serde(default, deserialize_with = "scalar")]
    host: Option<String>,
    #[serde(default, deserialize_with = "scalar")]
    username: Option<String>,
}

impl SshSettings {
    pub fn normalize(name: &str, entry: &Mapping) -> Result<Self, ConfigError> {
        let raw: RawSsh = decode(name, entry)?;
        Ok(Self {
            host: require(raw.host, "host", name)?,
            username: require(raw.username, "username", name)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SshTransport {
    target_name: String,
    settings: SshSettings,
    keys_path: PathBuf,
    trusted: TrustedKeys,
    scanner: Arc<dyn HostKeyScanner>,
    ssh_config: SshConfigFile,
}

impl SshTransport {
    /// Load the pinned keys of `target_name` from the configuration directory.
    pub(crate) fn new(
        target_name: &str,
        settings: &SshSettings,
        conf: &Configuration,
    ) -> Result<Self, ConfigError> {
        let keys_path = conf.keys_path_for(target_name);
        let trusted = TrustedKeys::load_or_empty(&keys_path).map_err(|source| ConfigError::Keys {
            target: target_name.to_string(),
            source,
        })?;
        Ok(Self {
            target_name: target_name.to_string(),
            settings: settings.clone(),
            keys_path,
            trusted,
            scanner: Arc::new(Keyscan::default()),
            ssh_config: SshConfigFile::default(),
        })
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn HostKeyScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_ssh_config(mut self, file: SshConfigFile) -> Self {
        self.ssh_config = file;
        self
    }

    pub fn host(&self) -> &str {
        &self.settings.host
    }

    pub fn username(&self) -> &str {
        &self.settings.username
    }

    pub fn keys_path(&self) -> &Path {
        &self.keys_path
    }

    pub fn trusted_keys(&self) -> &TrustedKeys {
        &self.trusted
    }

    /// Alias used in the SSH client configuration for this target.
    pub fn alias(&self) -> String {
        alias_for(&self.target_name)
    }

    /// Compare the keys the host presents now with the pinned ones.
    ///
    /// A keyscan that runs but fails counts as untrusted; one that cannot
    /// be launched is an error.
    pub fn verify(&self) -> Result<TrustVerdict, SshError> {
        let live = match self.scanner.scan(&self.settings.host) {
            Ok(live) => live,
            Err(e @ SshError::KeyscanFailed { .. }) => {
                warn!(target = %self.target_name, error = %e, "cannot query host keys");
                return Ok(TrustVerdict::Untrusted);
            }
            Err(e) => return Err(e),
        };

        let verdict = self.trusted.verify(&live);
        if !verdict.is_trusted() {
            warn!(
                target = %self.target_name,
                host = %self.settings.host,
                pinned = self.trusted.len(),
                presented = live.len(),
                "host keys do not match the pinned keys"
            );
        }
        Ok(verdict)
    }

    pub fn available(&self) -> Result<bool, SshError> {
        Ok(self.verify()?.is_trusted())
    }

    /// Verify the host, then run `f` with the session alias installed.
    ///
    /// Returns [`RunOutcome::Untrusted`] without calling `f` when the host
    /// cannot be verified. A failure to remove the alias is logged and does
    /// not change the result of `f`.
    pub fn run_in_session<F>(&self, f: F) -> Result<RunOutcome, TargetError>
    where
        F: FnOnce(&str) -> Result<RunOutcome, TargetError>,
    {
        if !self.verify()?.is_trusted() {
            return Ok(RunOutcome::Untrusted);
        }

        let entry = SessionEntry {
            target_name: &self.target_name,
            username: &self.settings.username,
            hostname: &self.settings.host,
            known_hosts: &self.keys_path,
        };
        let session = self.ssh_config.open_session(&entry)?;
        let result = f(session.alias());
        if let Err(e) = session.close() {
            warn!(target = %self.target_name, error = %e, "failed to remove ssh alias");
        }
        result
    }

    /// Query the host's keys and pin all of them.
    pub fn pin_keys(&self) -> Result<TrustedKeys, SshError> {
        let live = self.scanner.scan(&self.settings.host)?;
        if live.is_empty() {
            return Err(SshError::NoHostKeys {
                host: self.settings.host.clone(),
            });
        }
        let keys = TrustedKeys::new(live);
        keys.write_to(&self.keys_path, &self.settings.host)?;
        info!(
            target = %self.target_name,
            host = %self.settings.host,
            count = keys.len(),
            path = %self.keys_path.display(),
            "pinned host keys"
        );
        Ok(keys)
    }

    /// Remove a leftover alias of this target. Returns whether one was found.
    pub fn cleanup(&self) -> Result<bool, SshError> {
        self.ssh_config.remove(&self.alias())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{PinnedKey, StaticKeys};
    use crate::targets::test_support::empty_conf;
    use std::cell::Cell;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct FailingScan;

    impl HostKeyScanner for FailingScan {
        fn scan(&self, host: &str) -> Result<Vec<PinnedKey>, SshError> {
            Err(SshError::KeyscanFailed {
                host: host.to_string(),
                code: Some(1),
            })
        }
    }

    fn settings() -> SshSettings {
        SshSettings {
            host: "backup.lan".to_string(),
            username: "backup".to_string(),
        }
    }

    fn transport(tmp: &TempDir, live: Vec<PinnedKey>) -> SshTransport {
        let conf = empty_conf(tmp.path());
        SshTransport::new("nas", &settings(), &conf)
            .unwrap()
            .with_scanner(Arc::new(StaticKeys(live)))
            .with_ssh_config(SshConfigFile::new(tmp.path().join("ssh_config")))
    }

    fn pin(tmp: &TempDir, keys: &[PinnedKey]) {
        TrustedKeys::new(keys.iter().cloned())
            .write_to(&tmp.path().join("keys").join("nas.keys"), "backup.lan")
            .unwrap();
    }

    #[test]
    fn test_missing_fields() {
        let entry: Mapping = serde_yaml::from_str("{host: h}").unwrap();
        assert_eq!(
            SshSettings::normalize("t", &entry).unwrap_err().to_string(),
            "missing 'username' field in target 't'"
        );
    }

    #[test]
    fn test_no_pinned_keys_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let transport = transport(&tmp, vec![PinnedKey::new("ssh-ed25519", "AAA")]);
        assert!(transport.trusted_keys().is_empty());
        assert!(!transport.available().unwrap());
    }

    #[test]
    fn test_matching_key_is_available() {
        let tmp = TempDir::new().unwrap();
        pin(&tmp, &[PinnedKey::new("ssh-ed25519", "AAA")]);
        let transport = transport(
            &tmp,
            vec![
                PinnedKey::new("ssh-rsa", "OTHER"),
                PinnedKey::new("ssh-ed25519", "AAA"),
            ],
        );
        assert!(transport.available().unwrap());
    }

    #[test]
    fn test_changed_key_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        pin(&tmp, &[PinnedKey::new("ssh-ed25519", "AAA")]);
        let transport = transport(&tmp, vec![PinnedKey::new("ssh-ed25519", "BBB")]);
        assert!(!transport.available().unwrap());
    }

    #[test]
    fn test_keyscan_failure_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        pin(&tmp, &[PinnedKey::new("ssh-ed25519", "AAA")]);
        let transport = transport(&tmp, vec![]).with_scanner(Arc::new(FailingScan));
        assert!(!transport.available().unwrap());
    }

    #[test]
    fn test_untrusted_host_runs_nothing() {
        let tmp = TempDir::new().unwrap();
        let transport = transport(&tmp, vec![PinnedKey::new("ssh-ed25519", "AAA")]);
        let called = Cell::new(false);
        let outcome = transport
            .run_in_session(|_| {
                called.set(true);
                Ok(RunOutcome::Success)
            })
            .unwrap();
        assert_eq!(outcome, RunOutcome::Untrusted);
        assert!(!called.get());
        assert!(!tmp.path().join("ssh_config").exists());
    }

    #[test]
    fn test_session_alias_installed_then_removed() {
        let tmp = TempDir::new().unwrap();
        let key = PinnedKey::new("ssh-ed25519", "AAA");
        pin(&tmp, std::slice::from_ref(&key));
        let transport = transport(&tmp, vec![key]);
        let config_path = tmp.path().join("ssh_config");

        let outcome = transport
            .run_in_session(|alias| {
                assert_eq!(alias, "restic-service-host-nas");
                let contents = fs::read_to_string(&config_path).unwrap();
                assert!(contents.contains("Host restic-service-host-nas"));
                assert!(contents.contains("  User backup"));
                assert!(contents.contains("  Hostname backup.lan"));
                assert!(contents.contains(&format!(
                    "  UserKnownHostsFile {}",
                    tmp.path().join("keys").join("nas.keys").display()
                )));
                Ok(RunOutcome::Failed { code: Some(1) })
            })
            .unwrap();

        assert_eq!(outcome, RunOutcome::Failed { code: Some(1) });
        assert!(!fs::read_to_string(&config_path).unwrap().contains("restic-service-host-nas"));
    }

    #[test]
    fn test_alias_removed_when_operation_errors() {
        let tmp = TempDir::new().unwrap();
        let key = PinnedKey::new("ssh-ed25519", "AAA");
        pin(&tmp, std::slice::from_ref(&key));
        let transport = transport(&tmp, vec![key]);

        let result = transport.run_in_session(|_| {
            Err(TargetError::ForgetUnsupported("nas".to_string()))
        });
        assert!(result.is_err());
        let contents = fs::read_to_string(tmp.path().join("ssh_config")).unwrap();
        assert!(!contents.contains("restic-service-host-nas"));
    }

    #[test]
    fn test_pin_keys_writes_key_file() {
        let tmp = TempDir::new().unwrap();
        let transport = transport(
            &tmp,
            vec![
                PinnedKey::new("ssh-ed25519", "AAA"),
                PinnedKey::new("ssh-rsa", "BBB"),
            ],
        );
        let keys = transport.pin_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(TrustedKeys::load(transport.keys_path()).unwrap(), keys);
    }

    #[test]
    fn test_pin_keys_refuses_empty_scan() {
        let tmp = TempDir::new().unwrap();
        let transport = transport(&tmp, vec![]);
        assert!(matches!(
            transport.pin_keys(),
            Err(SshError::NoHostKeys { .. })
        ));
        assert!(!transport.keys_path().exists());
    }

    #[test]
    fn test_cleanup_removes_leftover_alias() {
        let tmp = TempDir::new().unwrap();
        let transport = transport(&tmp, vec![]);
        let file = SshConfigFile::new(tmp.path().join("ssh_config"));
        file.install(&SessionEntry {
            target_name: "nas",
            username: "backup",
            hostname: "backup.lan",
            known_hosts: Path::new("/k"),
        })
        .unwrap();

        assert!(transport.cleanup().unwrap());
        assert!(!transport.cleanup().unwrap());
    }
}
