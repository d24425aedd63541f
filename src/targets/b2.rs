//! Backblaze B2 credentials shared by the restic and rclone B2 targets.

use std::fmt;

use serde::Deserialize;
use serde_yaml::Mapping;

use super::{decode, require, scalar};
use crate::config::ConfigError;

#[derive(Clone, PartialEq, Eq)]
pub struct B2Settings {
    pub bucket: String,
    pub path: String,
    pub id: String,
    pub key: String,
}

#[derive(Deserialize)]
struct RawB2 {
    #[serde(default, deserialize_with = "scalar")]
    bucket: Option<String>,
    #[serde(default, deserialize_with = "scalar")]
    path: Option<String>,
    #[serde(default, deserialize_with = "scalar")]
    id: Option<String>,
    #[serde(default, deserialize_with = "scalar")]
    key: Option<String>,
}

impl B2Settings {
    pub fn normalize(name: &str, entry: &Mapping) -> Result<Self, ConfigError> {
        let raw: RawB2 = decode(name, entry)?;
        Ok(Self {
            bucket: require(raw.bucket, "bucket", name)?,
            path: require(raw.path, "path", name)?,
            id: require(raw.id, "id", name)?,
            key: require(raw.key, "key", name)?,
        })
    }

    /// Credentials as restic reads them from its environment.
    pub fn env(&self) -> [(&str, &str); 2] {
        [
            ("B2_ACCOUNT_ID", self.id.as_str()),
            ("B2_ACCOUNT_KEY", self.key.as_str()),
        ]
    }
}

impl fmt::Debug for B2Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("B2Settings")
            .field("bucket", &self.bucket)
            .field("path", &self.path)
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_fields_checked_in_order() {
        let err = B2Settings::normalize("t", &entry("{path: p, id: i, key: k}")).unwrap_err();
        assert_eq!(err.to_string(), "missing 'bucket' field in target 't'");

        let err = B2Settings::normalize("t", &entry("{bucket: b, path: p, id: i}")).unwrap_err();
        assert_eq!(err.to_string(), "missing 'key' field in target 't'");
    }

    #[test]
    fn test_numeric_values_accepted() {
        let settings =
            B2Settings::normalize("t", &entry("{bucket: b, path: 2024, id: 12345, key: k}")).unwrap();
        assert_eq!(settings.path, "2024");
        assert_eq!(settings.id, "12345");
    }

    #[test]
    fn test_debug_redacts_key() {
        let settings =
            B2Settings::normalize("t", &entry("{bucket: b, path: p, id: i, key: s3cr3t}")).unwrap();
        assert!(!format!("{settings:?}").contains("s3cr3t"));
        assert_eq!(settings.env()[1], ("B2_ACCOUNT_KEY", "s3cr3t"));
    }
}
