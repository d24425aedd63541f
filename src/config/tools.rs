//! Resolution of the external tools (restic, rclone) used by targets.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::ConfigError;

/// Tools that can be configured in the `tools` section.
pub const KNOWN_TOOLS: &[&str] = &["restic", "rclone"];

/// A configured tool and whether it was found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEntry {
    /// Absolute path if resolution succeeded, otherwise the configured value.
    pub path: PathBuf,
    /// Whether `path` points to an existing file.
    pub available: bool,
}

/// Resolved tool paths for one configuration.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    entries: BTreeMap<String, ToolEntry>,
}

impl ToolRegistry {
    /// Resolve every known tool against the process search path.
    pub fn resolve(configured: &BTreeMap<String, String>) -> Self {
        Self::resolve_in(configured, std::env::var_os("PATH"))
    }

    /// Resolve every known tool against an explicit search path.
    ///
    /// Absolute paths are taken as-is. Relative paths are looked up in
    /// `search_path`; the first match wins. Tools that cannot be found are
    /// kept in the registry, flagged as unavailable.
    pub fn resolve_in(
        configured: &BTreeMap<String, String>,
        search_path: Option<OsString>,
    ) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let mut entries = BTreeMap::new();

        for &tool in KNOWN_TOOLS {
            let value = configured.get(tool).map(String::as_str).unwrap_or(tool);
            let configured_path = Path::new(value);

            let entry = if configured_path.is_absolute() {
                ToolEntry {
                    path: configured_path.to_path_buf(),
                    available: configured_path.is_file(),
                }
            } else {
                match which::which_in(value, search_path.clone(), &cwd) {
                    Ok(found) => ToolEntry {
                        path: found,
                        available: true,
                    },
                    Err(_) => ToolEntry {
                        path: configured_path.to_path_buf(),
                        available: false,
                    },
                }
            };

            if entry.available {
                debug!(tool, path = %entry.path.display(), "resolved tool");
            } else {
                warn!(tool, path = %entry.path.display(), "cannot find path to {tool}");
            }
            entries.insert(tool.to_string(), entry);
        }

        Self { entries }
    }

    /// Whether the tool was found.
    pub fn is_available(&self, tool: &str) -> bool {
        self.entries.get(tool).is_some_and(|e| e.available)
    }

    /// Full path of an available tool.
    pub fn path(&self, tool: &str) -> Result<&Path, ConfigError> {
        let entry = self
            .entries
            .get(tool)
            .ok_or_else(|| ConfigError::UnknownTool(tool.to_string()))?;
        if entry.available {
            Ok(&entry.path)
        } else {
            Err(ConfigError::ToolUnavailable {
                tool: tool.to_string(),
                path: entry.path.clone(),
            })
        }
    }

    /// Configured path of a tool, whether or not it exists on disk.
    pub fn path_optional(&self, tool: &str) -> Result<&Path, ConfigError> {
        self.entries
            .get(tool)
            .map(|e| e.path.as_path())
            .ok_or_else(|| ConfigError::UnknownTool(tool.to_string()))
    }

    /// Iterate over all tools in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ToolEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tools(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_absolute_path_used_as_is() {
        let tmp = TempDir::new().unwrap();
        let restic = tmp.path().join("restic-test");
        fs::write(&restic, "").unwrap();

        let registry = ToolRegistry::resolve_in(
            &tools(&[("restic", restic.to_str().unwrap())]),
            Some(OsString::new()),
        );
        assert_eq!(registry.path("restic").unwrap(), restic.as_path());
    }

    #[test]
    fn test_missing_absolute_path_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let restic = tmp.path().join("restic-test");

        let registry = ToolRegistry::resolve_in(
            &tools(&[("restic", restic.to_str().unwrap())]),
            Some(OsString::new()),
        );
        assert!(!registry.is_available("restic"));
        assert!(matches!(
            registry.path("restic"),
            Err(ConfigError::ToolUnavailable { .. })
        ));
        assert_eq!(registry.path_optional("restic").unwrap(), restic.as_path());
    }

    #[cfg(unix)]
    #[test]
    fn test_relative_path_resolved_in_search_path() {
        let tmp = TempDir::new().unwrap();
        let restic = tmp.path().join("restic-test");
        make_executable(&restic);

        let search = std::env::join_paths([Path::new("/nonexistent-dir"), tmp.path()]).unwrap();
        let registry =
            ToolRegistry::resolve_in(&tools(&[("restic", "restic-test")]), Some(search));
        assert_eq!(registry.path("restic").unwrap(), restic.as_path());
    }

    #[test]
    fn test_unresolved_relative_path_is_recorded() {
        let tmp = TempDir::new().unwrap();
        let registry = ToolRegistry::resolve_in(
            &tools(&[("restic", "restic-test")]),
            Some(tmp.path().as_os_str().to_os_string()),
        );
        assert!(!registry.is_available("restic"));
        assert_eq!(
            registry.path_optional("restic").unwrap(),
            Path::new("restic-test")
        );
    }

    #[test]
    fn test_unknown_tool() {
        let registry = ToolRegistry::resolve_in(&BTreeMap::new(), Some(OsString::new()));
        assert!(matches!(
            registry.path("rsync"),
            Err(ConfigError::UnknownTool(_))
        ));
        assert_eq!(registry.iter().count(), KNOWN_TOOLS.len());
    }
}
