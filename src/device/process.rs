//! Host subprocess transport with per-call timeout.

use super::{CommandResult, CommandRunner, RC_CANNOT_EXECUTE, RC_INVALID_INPUT, RC_NOT_FOUND, RC_TIMEOUT};
use std::time::Duration;
use tracing::{debug, warn};

/// Runs commands as local subprocesses (`adb` lives on the host).
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn execute(&self, argv: Vec<String>, timeout: Duration) -> CommandResult {
        let Some((bin, rest)) = argv.split_first() else {
            return CommandResult::new(argv, RC_INVALID_INPUT, "", "empty argument vector");
        };

        debug!(cmd = ?argv, timeout_s = timeout.as_secs_f64(), "Executing command");

        // kill_on_drop reaps the child when the timeout future wins the race.
        let child = tokio::process::Command::new(bin)
            .args(rest)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(out)) => {
                let code = out.status.code().unwrap_or(-1);
                CommandResult::new(
                    argv,
                    code,
                    &String::from_utf8_lossy(&out.stdout),
                    &String::from_utf8_lossy(&out.stderr),
                )
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(bin = %bin, "Command binary not found");
                let msg = format!("{}: command not found", bin);
                CommandResult::new(argv, RC_NOT_FOUND, "", &msg)
            }
            Ok(Err(e)) => {
                warn!(bin = %bin, error = %e, "Failed to spawn command");
                let msg = format!("{}: {}", bin, e);
                CommandResult::new(argv, RC_CANNOT_EXECUTE, "", &msg)
            }
            Err(_) => {
                warn!(cmd = ?argv, timeout_s = timeout.as_secs_f64(), "Command timed out");
                CommandResult::new(argv, RC_TIMEOUT, "", "command timed out")
            }
        }
    }
}
