//! Synchronization and retention passes over the configured targets.
//!
//! A pass walks the selected targets in registration order. Each target is
//! checked for availability, then run; unavailable targets are skipped and
//! failures never stop the pass. Every target gets one [`TargetReport`].

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{ConfigError, Configuration};
use crate::targets::{RunOutcome, Target, TargetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Sync,
    Forget,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Forget => write!(f, "forget"),
        }
    }
}

/// What happened to one target during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetStatus {
    Success,
    /// The tool exited non-zero.
    Failed { code: Option<i32> },
    /// The host stopped presenting a pinned key between the availability
    /// check and the run.
    Untrusted,
    /// Skipped: not reachable right now.
    Unavailable,
    /// Skipped: the target has no retention support.
    Unsupported,
    /// The availability check or the tool could not run at all.
    Error { message: String },
}

impl TargetStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. } | Self::Untrusted | Self::Error { .. }
        )
    }
}

impl From<RunOutcome> for TargetStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Success => Self::Success,
            RunOutcome::Failed { code } => Self::Failed { code },
            RunOutcome::Untrusted => Self::Untrusted,
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "ok"),
            Self::Failed { code: Some(code) } => write!(f, "failed (exit code {code})"),
            Self::Failed { code: None } => write!(f, "failed (terminated by signal)"),
            Self::Untrusted => write!(f, "untrusted host"),
            Self::Unavailable => write!(f, "not available"),
            Self::Unsupported => write!(f, "forget not supported"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

/// Report for one target in a pass.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    #[serde(serialize_with = "serialize_kind")]
    pub kind: TargetKind,
    #[serde(flatten)]
    pub status: TargetStatus,
    pub duration_ms: u64,
}

fn serialize_kind<S: serde::Serializer>(kind: &TargetKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

/// Report for a whole pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub operation: Operation,
    pub targets: Vec<TargetReport>,
    pub total_duration_ms: u64,
}

impl PassReport {
    pub fn succeeded(&self) -> usize {
        self.targets
            .iter()
            .filter(|r| r.status == TargetStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.targets.iter().filter(|r| r.status.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.targets.len() - self.succeeded() - self.failed()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }
}

/// Availability of one target, as printed by `whereami`.
#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub target: String,
    #[serde(serialize_with = "serialize_kind")]
    pub kind: TargetKind,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Passes
// =============================================================================

/// Targets named in `names`, in registration order, or all targets when
/// `names` is empty.
pub fn select_targets<'a>(
    conf: &'a Configuration,
    names: &[String],
) -> Result<Vec<&'a Target>, ConfigError> {
    if let Some(unknown) = names
        .iter()
        .find(|name| conf.target_by_name(name).is_err())
    {
        return Err(ConfigError::NoSuchTarget(unknown.clone()));
    }
    Ok(conf
        .targets()
        .iter()
        .filter(|t| names.is_empty() || names.iter().any(|n| n == t.name()))
        .collect())
}

/// Check every target without running anything.
pub fn whereami(targets: &[&Target]) -> Vec<Availability> {
    targets
        .iter()
        .map(|target| {
            let (available, error) = match target.available() {
                Ok(available) => (available, None),
                Err(e) => (false, Some(e.to_string())),
            };
            Availability {
                target: target.name().to_string(),
                kind: target.kind(),
                available,
                error,
            }
        })
        .collect()
}

pub fn run_sync(targets: &[&Target]) -> PassReport {
    run_pass(targets, Operation::Sync)
}

pub fn run_forget(targets: &[&Target]) -> PassReport {
    run_pass(targets, Operation::Forget)
}

/// Run one operation over `targets`, continuing past failures.
pub fn run_pass(targets: &[&Target], operation: Operation) -> PassReport {
    let start = Instant::now();
    let reports = targets
        .iter()
        .map(|target| run_target(target, operation))
        .collect();
    PassReport {
        operation,
        targets: reports,
        total_duration_ms: start.elapsed().as_millis() as u64,
    }
}

fn run_target(target: &Target, operation: Operation) -> TargetReport {
    let start = Instant::now();
    let name = target.name();
    let status = target_status(target, operation);

    match &status {
        TargetStatus::Success => info!(target = %name, %operation, "done"),
        TargetStatus::Unavailable => info!(target = %name, "not available, skipping"),
        TargetStatus::Unsupported => info!(target = %name, "does not support forget, skipping"),
        TargetStatus::Error { message } => {
            error!(target = %name, %operation, error = %message, "target failed")
        }
        other => warn!(target = %name, %operation, status = %other, "target failed"),
    }

    TargetReport {
        target: name.to_string(),
        kind: target.kind(),
        status,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

fn target_status(target: &Target, operation: Operation) -> TargetStatus {
    if operation == Operation::Forget && !target.supports_forget() {
        return TargetStatus::Unsupported;
    }

    match target.available() {
        Ok(true) => {}
        Ok(false) => return TargetStatus::Unavailable,
        Err(e) => {
            return TargetStatus::Error {
                message: e.to_string(),
            };
        }
    }

    info!(target = %target.name(), %operation, destination = %target.describe(), "starting");
    let result = match operation {
        Operation::Sync => target.synchronize(),
        Operation::Forget => target.forget(),
    };
    match result {
        Ok(outcome) => outcome.into(),
        Err(e) => TargetStatus::Error {
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NormalizedConfig, RawConfig, ToolRegistry, normalize};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn configuration(conf_dir: &Path, yaml: &str) -> Configuration {
        let normalized: NormalizedConfig = normalize(&RawConfig::from_yaml_str(yaml).unwrap()).unwrap();
        let tools = ToolRegistry::resolve_in(&normalized.tools, Some(std::ffi::OsString::new()));
        Configuration::from_normalized(conf_dir, normalized, tools).unwrap()
    }

    #[cfg(unix)]
    fn script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn file_targets(tmp: &TempDir, restic: &Path) -> Configuration {
        let present = tmp.path().join("present");
        fs::create_dir_all(&present).unwrap();
        configuration(
            tmp.path(),
            &format!(
                "tools:
  restic: '{restic}'
targets:
  - {{name: absent, type: restic-file, dest: '{absent}', password: pw, includes: [/home], io_class: null, cpu_priority: null}}
  - {{name: present, type: restic-file, dest: '{present}', password: pw, includes: [/home], io_class: null, cpu_priority: null}}
",
                restic = restic.display(),
                absent = tmp.path().join("absent").display(),
                present = present.display(),
            ),
        )
    }

    #[test]
    fn test_select_all_in_order() {
        let tmp = TempDir::new().unwrap();
        let conf = file_targets(&tmp, Path::new("/nonexistent/restic"));
        let names: Vec<_> = select_targets(&conf, &[])
            .unwrap()
            .iter()
            .map(|t| t.name())
            .collect();
        assert_eq!(names, vec!["absent", "present"]);
    }

    #[test]
    fn test_select_named_keeps_registration_order() {
        let tmp = TempDir::new().unwrap();
        let conf = file_targets(&tmp, Path::new("/nonexistent/restic"));
        let selected =
            select_targets(&conf, &["present".to_string(), "absent".to_string()]).unwrap();
        assert_eq!(selected[0].name(), "absent");

        let err = select_targets(&conf, &["other".to_string()]).unwrap_err();
        assert_eq!(err.to_string(), "no target named 'other'");
    }

    #[test]
    fn test_whereami() {
        let tmp = TempDir::new().unwrap();
        let conf = file_targets(&tmp, Path::new("/nonexistent/restic"));
        let report = whereami(&select_targets(&conf, &[]).unwrap());
        assert!(!report[0].available);
        assert!(report[1].available);
        assert!(report.iter().all(|a| a.error.is_none()));
    }

    #[test]
    fn test_missing_tool_is_an_error_and_pass_continues() {
        let tmp = TempDir::new().unwrap();
        let conf = file_targets(&tmp, Path::new("/nonexistent/restic"));
        let report = run_sync(&select_targets(&conf, &[]).unwrap());

        assert_eq!(report.targets.len(), 2);
        assert_eq!(report.targets[0].status, TargetStatus::Unavailable);
        assert!(matches!(report.targets[1].status, TargetStatus::Error { .. }));
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert!(!report.all_succeeded());
    }

    #[cfg(unix)]
    #[test]
    fn test_sync_and_forget_pass() {
        let tmp = TempDir::new().unwrap();
        let restic = tmp.path().join("restic");
        let log = tmp.path().join("calls.log");
        script(&restic, &format!("echo \"$@\" >> '{}'", log.display()));
        let conf = file_targets(&tmp, &restic);
        let targets = select_targets(&conf, &[]).unwrap();

        let sync = run_sync(&targets);
        assert_eq!(sync.succeeded(), 1);
        assert!(sync.all_succeeded());

        let forget = run_forget(&targets);
        assert_eq!(forget.targets[1].status, TargetStatus::Success);

        let calls = fs::read_to_string(&log).unwrap();
        let lines: Vec<_> = calls.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("backup /home"));
        assert!(lines[1].ends_with("forget --prune"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_recorded() {
        let tmp = TempDir::new().unwrap();
        let restic = tmp.path().join("restic");
        script(&restic, "exit 1");
        let conf = file_targets(&tmp, &restic);

        let report = run_sync(&select_targets(&conf, &[]).unwrap());
        assert_eq!(
            report.targets[1].status,
            TargetStatus::Failed { code: Some(1) }
        );
        assert_eq!(report.failed(), 1);
    }

    #[test]
    fn test_forget_skips_unsupported_targets() {
        let tmp = TempDir::new().unwrap();
        let conf = configuration(
            tmp.path(),
            &format!(
                "targets:\n  - {{name: mirror, type: rclone-b2, bucket: b, path: p, id: i, key: k, src: '{}'}}\n",
                tmp.path().display()
            ),
        );
        let report = run_forget(&select_targets(&conf, &[]).unwrap());
        assert_eq!(report.targets[0].status, TargetStatus::Unsupported);
        assert!(report.all_succeeded());
    }

    #[test]
    fn test_report_serializes() {
        let report = TargetReport {
            target: "nas".to_string(),
            kind: TargetKind::ResticSftp,
            status: TargetStatus::Failed { code: Some(3) },
            duration_ms: 12,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "restic-sftp");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["code"], 3);
    }
}
