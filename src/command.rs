//! Construction and execution of external tool invocations.
//!
//! Every tool run by a target goes through [`CommandBuilder`]:
//!
//! - I/O and CPU priority wrappers (`ionice`, `nice`) are prepended from the
//!   target's [`ResourcePolicy`].
//! - Secrets are placed in the child environment only, never in argv.
//! - The child's stdin is always `/dev/null`.
//! - `HOME` is provided to the child when the parent has none, without
//!   touching the parent's environment.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Output, Stdio};

use thiserror::Error;
use tracing::debug;

/// Home directory used when neither `$HOME` nor the passwd entry resolve.
pub const HOME_FALLBACK: &str = "/root";

/// Errors raised while launching an external tool.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Home directory for the current user, falling back to [`HOME_FALLBACK`].
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(HOME_FALLBACK))
}

// =============================================================================
// Resource policy
// =============================================================================

/// I/O scheduling class, as understood by `ionice -c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// Kernel default.
    None,
    /// Highest priority.
    Realtime,
    /// Normal priority.
    BestEffort,
    /// Only gets disk time when nobody else needs it.
    Idle,
}

impl IoClass {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Realtime),
            2 => Some(Self::BestEffort),
            3 => Some(Self::Idle),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Realtime => 1,
            Self::BestEffort => 2,
            Self::Idle => 3,
        }
    }
}

impl fmt::Display for IoClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Realtime => write!(f, "realtime"),
            Self::BestEffort => write!(f, "best-effort"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Process priority applied to a target's tool invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePolicy {
    /// I/O class; `None` disables the `ionice` wrapper.
    pub io_class: Option<IoClass>,
    /// Priority within the class (0-7). Ignored for [`IoClass::Idle`].
    pub io_priority: u8,
    /// Niceness (-20..=19); `None` disables the `nice` wrapper.
    pub cpu_priority: Option<i8>,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            io_class: Some(IoClass::Idle),
            io_priority: 0,
            cpu_priority: Some(19),
        }
    }
}

impl ResourcePolicy {
    /// A policy that runs tools without any wrapper.
    pub fn unrestricted() -> Self {
        Self {
            io_class: None,
            io_priority: 0,
            cpu_priority: None,
        }
    }

    /// Wrapper argv to prepend in front of the tool.
    pub fn wrapper_args(&self) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::new();
        if let Some(class) = self.io_class {
            argv.push("ionice".into());
            argv.push("-c".into());
            argv.push(class.as_u8().to_string().into());
            if class != IoClass::Idle {
                argv.push("-n".into());
                argv.push(self.io_priority.to_string().into());
            }
        }
        if let Some(nice) = self.cpu_priority {
            argv.push("nice".into());
            argv.push("-n".into());
            argv.push(nice.to_string().into());
        }
        argv
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a single tool invocation.
#[derive(Clone)]
pub struct CommandBuilder {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<String, String>,
    resources: Option<ResourcePolicy>,
}

impl CommandBuilder {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            resources: None,
        }
    }

    /// Wrap the tool with the given priority policy.
    pub fn resources(mut self, policy: &ResourcePolicy) -> Self {
        self.resources = Some(*policy);
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an option only when `value` is set.
    pub fn opt_arg(self, flag: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.arg(flag).arg(v.to_string()),
            None => self,
        }
    }

    /// Append `--exclude <pattern>` for each pattern.
    pub fn excludes(mut self, patterns: &[String]) -> Self {
        for pattern in patterns {
            self.args.push("--exclude".into());
            self.args.push(pattern.into());
        }
        self
    }

    /// Set a variable in the child environment only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in vars {
            self.env.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn build(self) -> Invocation {
        let mut argv = self
            .resources
            .map(|r| r.wrapper_args())
            .unwrap_or_default();
        argv.push(self.program);
        argv.extend(self.args);

        let mut env = self.env;
        if std::env::var_os("HOME").is_none() {
            env.entry("HOME".to_string())
                .or_insert_with(|| home_dir().to_string_lossy().into_owned());
        }

        let program = argv.remove(0);
        Invocation {
            program,
            args: argv,
            env,
        }
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// A fully specified external process: executable, argv, env overlay.
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Environment overlay applied to the child.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Program followed by its arguments, lossily converted for inspection.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Shell-quoted command line, safe to log (no environment).
    pub fn command_line(&self) -> String {
        shell_words::join(self.argv())
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null());
        cmd
    }

    /// Run to completion with inherited stdout/stderr.
    pub fn run(&self) -> Result<ExitStatus, CommandError> {
        debug!(command = %self.command_line(), "running");
        self.to_command().status().map_err(|source| self.spawn_error(source))
    }

    /// Run to completion capturing stdout/stderr.
    pub fn output(&self) -> Result<Output, CommandError> {
        debug!(command = %self.command_line(), "running");
        self.to_command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| self.spawn_error(source))
    }

    fn spawn_error(&self, source: std::io::Error) -> CommandError {
        CommandError::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env: Vec<&str> = self.env.keys().map(String::as_str).collect();
        f.debug_struct("Invocation")
            .field("argv", &self.argv())
            .field("env", &env)
            .finish()
    }
}
