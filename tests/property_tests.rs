use proptest::prelude::*;
use restic_service::config::parse_bandwidth_limit;
use restic_service::ssh::{SessionEntry, SshConfigFile};
use std::fs;
use std::path::Path;

proptest! {
    #[test]
    fn test_plain_numbers_parse_to_themselves(n in 0u64..1_000_000_000_000) {
        prop_assert_eq!(parse_bandwidth_limit(&n.to_string()).unwrap(), n);
    }

    #[test]
    fn test_suffix_scales(n in 0u64..1_000_000, suffix in "[kKmMgG]", space in " {0,3}") {
        let scale = match suffix.to_ascii_lowercase().as_str() {
            "k" => 1_000,
            "m" => 1_000_000,
            _ => 1_000_000_000,
        };
        let text = format!("{n}{space}{suffix}");
        prop_assert_eq!(parse_bandwidth_limit(&text).unwrap(), n * scale);
    }

    #[test]
    fn test_other_suffixes_rejected(n in 0u64..1000, suffix in "[a-zA-Z]") {
        prop_assume!(!"kKmMgG".contains(suffix.as_str()));
        let text = format!("{n}{suffix}");
        prop_assert!(parse_bandwidth_limit(&text).is_err());
    }

    #[test]
    fn test_alias_install_then_remove_keeps_other_hosts(
        hosts in prop::collection::vec("[a-z]{1,8}", 0..4),
        name in "[a-z]{1,8}",
    ) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config");
        let original: String = hosts
            .iter()
            .map(|h| format!("Host {h}\n  User {h}\n"))
            .collect();
        fs::write(&path, &original).unwrap();

        let file = SshConfigFile::new(&path);
        let entry = SessionEntry {
            target_name: &name,
            username: "backup",
            hostname: "nas.lan",
            known_hosts: Path::new("/keys/nas.keys"),
        };
        let alias = file.install(&entry).unwrap();
        let again = file.install(&entry).unwrap();
        prop_assert_eq!(&again, &alias);
        prop_assert!(file.remove(&alias).unwrap());

        let after = fs::read_to_string(&path).unwrap();
        prop_assert!(!after.contains(&alias));
        prop_assert_eq!(after.trim_end(), original.trim_end());
    }
}
