//! Temporary `Host` entries in the SSH client configuration.
//!
//! Tools that reach a target over SSH (restic's sftp backend, rsync) are
//! pointed at an alias instead of the real host. The alias binds the user,
//! the hostname and the target's pinned key file, so the connection is only
//! accepted if the host presents a pinned key:
//!
//! ```text
//! # Added by restic-service
//! Host restic-service-host-<name>
//!   User <username>
//!   Hostname <host>
//!   UserKnownHostsFile <key-file>
//! ```
//!
//! The entry is written when a session opens and removed when the
//! [`SshSession`] guard is closed or dropped.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{SshError, set_mode, write_atomic};
use crate::command::home_dir;

/// Prefix of every alias written by this crate.
pub const ALIAS_PREFIX: &str = "restic-service-host-";

const MARKER: &str = "# Added by restic-service";

/// Parameters of one session alias.
#[derive(Debug, Clone)]
pub struct SessionEntry<'a> {
    pub target_name: &'a str,
    pub username: &'a str,
    pub hostname: &'a str,
    pub known_hosts: &'a Path,
}

impl SessionEntry<'_> {
    pub fn alias(&self) -> String {
        alias_for(self.target_name)
    }

    fn lines(&self) -> [String; 5] {
        [
            MARKER.to_string(),
            format!("Host {}", self.alias()),
            format!("  User {}", self.username),
            format!("  Hostname {}", self.hostname),
            format!("  UserKnownHostsFile {}", self.known_hosts.display()),
        ]
    }
}

/// Alias name for a target.
pub fn alias_for(target_name: &str) -> String {
    format!("{ALIAS_PREFIX}{target_name}")
}

/// The SSH client configuration file edited by sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfigFile {
    path: PathBuf,
}

impl Default for SshConfigFile {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl SshConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.ssh/config` for the current user.
    pub fn default_path() -> PathBuf {
        home_dir().join(".ssh").join("config")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the alias for `entry`, replacing any previous one with the same
    /// name. Returns the alias.
    pub fn install(&self, entry: &SessionEntry<'_>) -> Result<String, SshError> {
        let alias = entry.alias();
        let mut lines = self.read_lines()?.unwrap_or_default();
        remove_alias(&mut lines, &alias);

        if lines.last().is_some_and(|l| !l.is_empty()) {
            lines.push(String::new());
        }
        lines.extend(entry.lines());

        self.write_lines(&lines)?;
        debug!(alias = %alias, path = %self.path.display(), "installed ssh alias");
        Ok(alias)
    }

    /// Remove every entry for `alias`. Returns whether anything was removed.
    ///
    /// The `Host` line, the comment lines right above it and the option lines
    /// below it (up to the next unindented line) are removed together.
    pub fn remove(&self, alias: &str) -> Result<bool, SshError> {
        let Some(mut lines) = self.read_lines()? else {
            return Ok(false);
        };
        if !remove_alias(&mut lines, alias) {
            return Ok(false);
        }
        self.write_lines(&lines)?;
        debug!(alias, path = %self.path.display(), "removed ssh alias");
        Ok(true)
    }

    /// Install the alias and return a guard that removes it again.
    pub fn open_session(&self, entry: &SessionEntry<'_>) -> Result<SshSession<'_>, SshError> {
        let alias = self.install(entry)?;
        Ok(SshSession {
            file: self,
            alias,
            closed: false,
        })
    }

    fn read_lines(&self) -> Result<Option<Vec<String>>, SshError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text.lines().map(str::to_string).collect())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SshError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write_lines(&self, lines: &[String]) -> Result<(), SshError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
            set_mode(dir, 0o700).map_err(io_error(dir))?;
        }

        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        write_atomic(&self.path, &contents, 0o600).map_err(io_error(&self.path))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SshError {
    let path = path.to_path_buf();
    move |source| SshError::Io { path, source }
}

/// Whether `line` ends the option lines of an alias block.
///
/// Options of our own block are indented, so any unindented line (another
/// `Host`, an `Include`, a global option, a user comment) is a boundary.
/// Section keywords are matched case-insensitively even when indented.
fn ends_block(line: &str) -> bool {
    if line.trim().is_empty() {
        return false;
    }
    if !line.starts_with([' ', '\t']) {
        return true;
    }
    let keyword = line
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '=')
        .next()
        .unwrap_or_default();
    keyword.eq_ignore_ascii_case("host") || keyword.eq_ignore_ascii_case("match")
}

fn remove_alias(lines: &mut Vec<String>, alias: &str) -> bool {
    let host_line = format!("Host {alias}");
    let mut removed = false;

    while let Some(start) = lines.iter().position(|l| l.trim() == host_line) {
        let mut first = start;
        while first > 0 && lines[first - 1].trim_start().starts_with('#') {
            first -= 1;
        }
        let mut end = start + 1;
        while end < lines.len() && !ends_block(&lines[end]) {
            end += 1;
        }
        lines.drain(first..end);
        removed = true;
    }
    removed
}

/// An installed alias. Removed on [`close`](Self::close) or drop.
#[derive(Debug)]
pub struct SshSession<'a> {
    file: &'a SshConfigFile,
    alias: String,
    closed: bool,
}

impl SshSession<'_> {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Remove the alias, reporting failures to the caller.
    pub fn close(mut self) -> Result<(), SshError> {
        self.closed = true;
        self.file.remove(&self.alias).map(|_| ())
    }
}

impl Drop for SshSession<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.file.remove(&self.alias) {
            warn!(alias = %self.alias, error = %e, "failed to remove ssh alias");
        }
    }
}
