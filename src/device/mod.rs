//! Device command executor -- classified, timed command execution against one
//! attached device.
//!
//! Every remote operation resolves to a single [`CommandResult`]. Transport
//! faults (missing binary, expired timeout) are return codes, not errors.

pub mod adb;
pub mod process;

#[cfg(test)]
pub(crate) mod mock;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use adb::Adb;
pub use process::ProcessRunner;

/// Return code used when the binary could not be found.
pub const RC_NOT_FOUND: i32 = 127;
/// Return code used when the call exceeded its timeout budget.
pub const RC_TIMEOUT: i32 = 124;
/// Return code used when the binary exists but could not be spawned.
pub const RC_CANNOT_EXECUTE: i32 = 126;
/// Return code used for host-side argument validation failures.
pub const RC_INVALID_INPUT: i32 = 2;

/// One executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub args: Vec<String>,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn new(args: Vec<String>, returncode: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            args,
            returncode,
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
        }
    }

    /// A result that never reached the transport.
    pub fn rejected(args: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            args,
            returncode: RC_INVALID_INPUT,
            stdout: String::new(),
            stderr: reason.into(),
        }
    }

    pub fn ok(&self) -> bool {
        self.returncode == 0
    }

    pub fn timed_out(&self) -> bool {
        self.returncode == RC_TIMEOUT
    }

    pub fn binary_missing(&self) -> bool {
        self.returncode == RC_NOT_FOUND
    }

    /// Best available human-readable cause: stderr, then stdout.
    pub fn failure_text(&self) -> &str {
        if !self.stderr.is_empty() {
            &self.stderr
        } else if !self.stdout.is_empty() {
            &self.stdout
        } else {
            "unknown error"
        }
    }
}

/// Executes an argument vector with a timeout.
///
/// Implementations must not return errors for ordinary command failure; the
/// outcome is always encoded in the returned [`CommandResult`].
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, argv: Vec<String>, timeout: Duration) -> CommandResult;
}

/// Quote a string for a POSIX shell.
///
/// Strings made only of `[A-Za-z0-9_@%+=:,./-]` are returned unchanged;
/// anything else is wrapped in single quotes with embedded quotes escaped.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let safe = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}
