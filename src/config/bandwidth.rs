//! Bandwidth limit parsing.
//!
//! Limits are expressed in bytes per second. The configuration accepts either
//! a plain YAML integer or a string such as `"500k"`, `"3 M"` or `"1g"`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::ConfigError;

static LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s*([kmg])?$").expect("valid bandwidth regex"));

/// A bandwidth limit as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BandwidthSpec {
    /// Plain number of bytes per second.
    Bytes(u64),
    /// Number with an optional k/M/G suffix.
    Text(String),
}

impl BandwidthSpec {
    /// Resolve to bytes per second. Zero is not a valid limit.
    pub fn to_bytes(&self) -> Result<u64, ConfigError> {
        let bytes = match self {
            Self::Bytes(bytes) => *bytes,
            Self::Text(text) => parse_bandwidth_limit(text)?,
        };
        if bytes == 0 {
            let written = match self {
                Self::Bytes(bytes) => bytes.to_string(),
                Self::Text(text) => text.clone(),
            };
            return Err(ConfigError::InvalidBandwidthLimit(written));
        }
        Ok(bytes)
    }
}

/// Parse a bandwidth limit string into bytes per second.
///
/// Suffixes are decimal (k = 1e3, M = 1e6, G = 1e9) and case-insensitive.
pub fn parse_bandwidth_limit(limit: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidBandwidthLimit(limit.to_string());

    let lowered = limit.trim().to_lowercase();
    let caps = LIMIT_RE.captures(&lowered).ok_or_else(invalid)?;

    let value: u64 = caps[1].parse().map_err(|_| invalid())?;
    let scale = match caps.get(2).map(|m| m.as_str()) {
        None => 1,
        Some("k") => 1_000,
        Some("m") => 1_000_000,
        Some("g") => 1_000_000_000,
        Some(_) => return Err(invalid()),
    };

    value.checked_mul(scale).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_number_string() {
        assert_eq!(parse_bandwidth_limit("100").unwrap(), 100);
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_bandwidth_limit("3k").unwrap(), 3_000);
        assert_eq!(parse_bandwidth_limit("3M").unwrap(), 3_000_000);
        assert_eq!(parse_bandwidth_limit("3G").unwrap(), 3_000_000_000);
    }

    #[test]
    fn test_space_between_value_and_suffix() {
        assert_eq!(parse_bandwidth_limit("3 G").unwrap(), 3_000_000_000);
    }

    #[test]
    fn test_suffix_is_case_insensitive() {
        assert_eq!(parse_bandwidth_limit("3g").unwrap(), 3_000_000_000);
        assert_eq!(parse_bandwidth_limit("3K").unwrap(), 3_000);
    }

    #[test]
    fn test_unknown_suffix_is_rejected() {
        let err = parse_bandwidth_limit("3B").unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot interpret '3B' as a valid bandwidth limit, give a plain number in bytes or use the k, M and G suffixes"
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_bandwidth_limit("").is_err());
        assert!(parse_bandwidth_limit("k").is_err());
        assert!(parse_bandwidth_limit("-3k").is_err());
        assert!(parse_bandwidth_limit("3.5M").is_err());
    }

    #[test]
    fn test_overflow_is_rejected() {
        assert!(parse_bandwidth_limit("99999999999999999999G").is_err());
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        assert!(BandwidthSpec::Bytes(0).to_bytes().is_err());
        assert!(BandwidthSpec::Text("0k".into()).to_bytes().is_err());
        assert_eq!(BandwidthSpec::Bytes(1).to_bytes().unwrap(), 1);
    }

    #[test]
    fn test_limit_from_yaml() {
        let plain: BandwidthSpec = serde_yaml::from_str("1500").unwrap();
        assert_eq!(plain.to_bytes().unwrap(), 1500);

        let text: BandwidthSpec = serde_yaml::from_str("\"2 M\"").unwrap();
        assert_eq!(text.to_bytes().unwrap(), 2_000_000);
    }
}
