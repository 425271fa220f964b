//! Scripted runner for unit tests.

use super::{CommandResult, CommandRunner};
use std::sync::Mutex;
use std::time::Duration;

/// Replies to commands whose joined argv contains a registered needle; any
/// other command succeeds with empty output. Later rules win.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, i32, String, String)>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn reply(self, needle: &str, returncode: i32, stdout: &str, stderr: &str) -> Self {
        self.rules.lock().unwrap().push((
            needle.to_string(),
            returncode,
            stdout.to_string(),
            stderr.to_string(),
        ));
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Shell command strings (the argument after `shell`) in call order.
    pub fn shell_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|argv| {
                let pos = argv.iter().position(|a| a == "shell")?;
                argv.get(pos + 1).cloned()
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(&self, argv: Vec<String>, _timeout: Duration) -> CommandResult {
        self.calls.lock().unwrap().push(argv.clone());
        let joined = argv.join(" ");
        let rule = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(needle, ..)| joined.contains(needle.as_str()))
            .cloned();
        match rule {
            Some((_, rc, out, err)) => CommandResult::new(argv, rc, &out, &err),
            None => CommandResult::new(argv, 0, "", ""),
        }
    }
}
