//! Workflow profiles -- fixed, ordered step sequences with fail-fast and
//! cooperative cancellation.
//!
//! A profile is a list of [`PlannedStep`]s. Each step is one device action
//! wrapped by [`Sequencer::run_step`]: check cancellation, time it, record it,
//! and abort the profile on failure. Cancellation is only observed between
//! steps; an in-flight command always runs to completion or timeout.
//!
//! Nothing is rolled back. When step *k* fails, whatever steps 1..k did to
//! the device stays done.

pub mod forensic;
pub mod offensive;

use crate::device::{Adb, CommandResult};
use crate::runlog::{RunLogError, RunLogger};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Captured output kept per step or error message.
pub const DETAIL_LIMIT: usize = 400;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{step} failed: {cause}")]
    StepFailed { step: String, cause: String },

    #[error("{step} failed: {cause}")]
    PreconditionFailed { step: String, cause: String },

    #[error("No package paths found for: {0}")]
    NoPackagePaths(String),

    #[error("Marker file is empty or unreadable: {0}")]
    MarkerUnreadable(String),

    #[error("Marker does not contain trace_token=...")]
    MarkerTokenMissing,

    #[error("Traceability check failed: {0}")]
    TraceNotCorroborated(String),

    #[error(transparent)]
    Record(#[from] RunLogError),
}

/// How a profile ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Completed,
    Cancelled,
}

/// One device action a step performs.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Devices,
    WaitForDevice,
    ClearLogcat,
    DumpLogcat(u32),
    ListPackages,
    PackagePaths(String),
    HashFile { path: String, root: bool },
    Pull { remote: String, local: PathBuf },
    NetworkSnapshot { root: bool },
    RootStatus,
    ReadFile(String),
    EnsureDir(String),
    WriteMarker { dir: String, file: String, content: String },
    WriteTraceLog { tag: String, message: String },
    InstallApk(PathBuf),
    Launch { package: String, activity: String },
    OpenUrl(String),
    SuShell(String),
}

impl Action {
    pub async fn perform(&self, adb: &Adb) -> CommandResult {
        match self {
            Action::Devices => adb.devices().await,
            Action::WaitForDevice => adb.wait_for_device().await,
            Action::ClearLogcat => adb.clear_logcat().await,
            Action::DumpLogcat(tail) => adb.dump_logcat(*tail).await,
            Action::ListPackages => adb.list_packages("").await,
            Action::PackagePaths(pkg) => adb.package_paths(pkg).await,
            Action::HashFile { path, root } => adb.sha256_file(path, *root).await,
            Action::Pull { remote, local } => adb.pull(remote, local).await,
            Action::NetworkSnapshot { root } => adb.network_snapshot(*root).await,
            Action::RootStatus => adb.root_status().await,
            Action::ReadFile(path) => adb.read_text_file(path).await,
            Action::EnsureDir(dir) => adb.ensure_dir(dir).await,
            Action::WriteMarker { dir, file, content } => {
                adb.write_marker(dir, file, content).await
            }
            Action::WriteTraceLog { tag, message } => adb.write_trace_log(tag, message).await,
            Action::InstallApk(path) => adb.install_apk(path).await,
            Action::Launch { package, activity } => adb.launch_package(package, activity).await,
            Action::OpenUrl(url) => adb.open_url(url).await,
            Action::SuShell(cmd) => adb.su_shell(cmd, std::time::Duration::from_secs(30)).await,
        }
    }
}

/// A named step; unlogged steps are preconditions that abort on failure but
/// leave no entry in the run record.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub name: String,
    pub action: Action,
    pub logged: bool,
}

impl PlannedStep {
    pub fn logged(name: &str, action: Action) -> Self {
        Self {
            name: name.to_string(),
            action,
            logged: true,
        }
    }

    pub fn required(name: &str, action: Action) -> Self {
        Self {
            name: name.to_string(),
            action,
            logged: false,
        }
    }
}

/// Truncate to at most `limit` characters.
pub fn bounded(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

fn result_details(result: &CommandResult) -> Value {
    let mut details = Map::new();
    details.insert("returncode".into(), json!(result.returncode));
    if !result.stdout.is_empty() {
        details.insert("stdout".into(), json!(bounded(&result.stdout, DETAIL_LIMIT)));
    }
    if !result.stderr.is_empty() {
        details.insert("stderr".into(), json!(bounded(&result.stderr, DETAIL_LIMIT)));
    }
    Value::Object(details)
}

/// Drives steps for one profile into one run logger.
///
/// `prefix` namespaces step names when several profiles share a run record.
pub struct Sequencer<'a> {
    adb: &'a Adb,
    logger: &'a mut RunLogger,
    cancel: &'a CancellationToken,
    prefix: String,
}

impl<'a> Sequencer<'a> {
    pub fn new(adb: &'a Adb, logger: &'a mut RunLogger, cancel: &'a CancellationToken) -> Self {
        Self {
            adb,
            logger,
            cancel,
            prefix: String::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    fn step_name(&self, name: &str) -> String {
        if self.prefix.is_empty() || name.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.prefix, name)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a logged step. `Ok(None)` means cancellation was observed first.
    pub async fn run_step(
        &mut self,
        name: &str,
        action: &Action,
    ) -> Result<Option<CommandResult>, WorkflowError> {
        if self.is_cancelled() {
            info!(step = %name, "Cancellation observed; skipping remaining steps");
            return Ok(None);
        }
        let name = self.step_name(name);
        let token = self.logger.begin_step(&name)?;
        let result = action.perform(self.adb).await;

        if result.ok() {
            debug!(step = %name, "Step ok");
            self.logger
                .end_step(token, &name, true, Some(result_details(&result)), None)?;
            return Ok(Some(result));
        }

        warn!(step = %name, rc = result.returncode, "Step failed");
        self.logger.end_step(
            token,
            &name,
            false,
            Some(result_details(&result)),
            Some(format!("{} failed with return code {}", name, result.returncode)),
        )?;
        Err(WorkflowError::StepFailed {
            step: name,
            cause: bounded(result.failure_text(), DETAIL_LIMIT),
        })
    }

    /// Run a required precondition without recording a step.
    pub async fn run_required(
        &mut self,
        name: &str,
        action: &Action,
    ) -> Result<Option<CommandResult>, WorkflowError> {
        if self.is_cancelled() {
            return Ok(None);
        }
        let result = action.perform(self.adb).await;
        if result.ok() {
            return Ok(Some(result));
        }
        warn!(step = %name, rc = result.returncode, "Required setup action failed");
        Err(WorkflowError::PreconditionFailed {
            step: self.step_name(name),
            cause: bounded(result.failure_text(), DETAIL_LIMIT),
        })
    }

    /// Run a plan in order, stopping at the first failure or cancellation.
    pub async fn run_plan(&mut self, plan: &[PlannedStep]) -> Result<Flow, WorkflowError> {
        for step in plan {
            let outcome = if step.logged {
                self.run_step(&step.name, &step.action).await?
            } else {
                self.run_required(&step.name, &step.action).await?
            };
            if outcome.is_none() {
                return Ok(Flow::Cancelled);
            }
        }
        Ok(Flow::Completed)
    }

    /// Record a host-side check (no device call) as a step.
    pub fn record_check(
        &mut self,
        name: &str,
        ok: bool,
        details: Option<Value>,
        error: Option<String>,
    ) -> Result<(), WorkflowError> {
        let name = self.step_name(name);
        let token = self.logger.begin_step(&name)?;
        self.logger.end_step(token, &name, ok, details, error)?;
        Ok(())
    }
}
