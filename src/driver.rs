//! Workflow driver -- one profile into one run record, in the foreground or on
//! a background task that another party can cancel.

use crate::compare::{self, ComparisonOutcome};
use crate::config::AppConfig;
use crate::device::adb::has_authorised_device;
use crate::device::Adb;
use crate::profiles::forensic::{
    run_extraction, run_traceability_check, ExtractionParams, TraceabilityParams,
};
use crate::profiles::offensive::{run_simulation, SimulationParams};
use crate::profiles::{Flow, Sequencer, WorkflowError};
use crate::runlog::{RunLogger, RunRecord, RunSink, RunStatus};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Subdirectory of a run directory that pulled artifacts land in.
pub const ARTIFACTS_DIR: &str = "forensic_artifacts";

/// UTC run identifier, e.g. `20260101T120000Z`.
pub fn new_run_id() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// `<logs>/<run_id>`, suffixed `-2`, `-3`, ... when a run already used it.
pub(crate) fn unused_run_dir(logs_dir: &Path, run_id: &str) -> PathBuf {
    let mut dir = logs_dir.join(run_id);
    let mut n = 2;
    while dir.exists() {
        dir = logs_dir.join(format!("{}-{}", run_id, n));
        n += 1;
    }
    dir
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    Forensic,
    Traceability,
    Offensive,
}

impl Workflow {
    pub fn mode(&self) -> &'static str {
        match self {
            Workflow::Forensic => "forensic",
            Workflow::Traceability => "traceability",
            Workflow::Offensive => "offensive",
        }
    }

    pub fn profile(&self) -> &'static str {
        match self {
            Workflow::Forensic => "independent_extraction",
            Workflow::Traceability => "traceability_check",
            Workflow::Offensive => "controlled_simulation",
        }
    }
}

/// Map how a profile ended onto the record's status and top-level error.
pub fn resolve_outcome(
    outcome: Result<Flow, WorkflowError>,
    cancel: &CancellationToken,
) -> (RunStatus, Option<String>) {
    match outcome {
        Ok(Flow::Completed) if cancel.is_cancelled() => (RunStatus::Cancelled, None),
        Ok(Flow::Completed) => (RunStatus::Success, None),
        Ok(Flow::Cancelled) => (RunStatus::Cancelled, None),
        Err(e) => {
            warn!(error = %e, "Workflow failed");
            (RunStatus::Error, Some(e.to_string()))
        }
    }
}

/// A finalized, written run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_json: PathBuf,
    pub record: RunRecord,
}

pub struct Driver {
    adb: Adb,
    config: AppConfig,
    logs_dir: PathBuf,
    sink: Option<Arc<dyn RunSink>>,
}

impl Driver {
    pub fn new(adb: Adb, config: AppConfig) -> Self {
        let logs_dir = config.logs_dir();
        Self {
            adb,
            config,
            logs_dir,
            sink: None,
        }
    }

    pub fn with_logs_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = logs_dir.into();
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn adb(&self) -> &Adb {
        &self.adb
    }

    /// Fails unless `adb devices` lists at least one authorised device.
    pub async fn ensure_device_attached(&self) -> Result<()> {
        let listed = self.adb.devices().await;
        if listed.ok() && has_authorised_device(&listed.stdout) {
            return Ok(());
        }
        bail!("No authorised ADB device detected (check: adb devices -l)")
    }

    fn describe(&self, workflow: Workflow, run_id: &str, logger: &mut RunLogger) {
        let gpio = &self.config.gpio;
        logger.set_meta("run_id", run_id);
        logger.set_meta("mode", workflow.mode());
        logger.set_meta("profile", workflow.profile());
        logger.set_meta("device_serial", self.adb.serial());
        logger.set_meta(
            "gpio_pins",
            json!({ "start": gpio.start, "cancel": gpio.cancel, "view": gpio.view_logs }),
        );

        match workflow {
            Workflow::Forensic => {
                let f = &self.config.forensic;
                logger.set_meta("logcat_tail", f.logcat_tail);
                logger.set_meta("target_package", f.target_package.as_str());
                logger.set_meta("pull_apk", f.pull_apk);
                logger.set_meta("collect_network", f.collect_network);
                logger.set_meta("root_mode", f.root_mode);
            }
            Workflow::Traceability => {
                let o = &self.config.offensive;
                logger.set_meta("marker_dir", o.marker_dir.as_str());
                logger.set_meta("marker_file", o.marker_file.as_str());
                logger.set_meta("trace_tag", o.trace_tag.as_str());
                logger.set_meta("logcat_tail", self.config.forensic.logcat_tail);
            }
            Workflow::Offensive => {
                let o = &self.config.offensive;
                logger.set_meta("trace_tag", o.trace_tag.as_str());
                logger.set_meta("trace_token", run_id);
                logger.set_meta("marker_file", o.marker_file.as_str());
                logger.set_meta("test_apk_path", o.test_apk_path.as_str());
                logger.set_meta("test_package", o.test_package.as_str());
                logger.set_meta("test_activity", o.test_activity.as_str());
                logger.set_meta("collect_network", o.collect_network);
            }
        }
    }

    /// Run one workflow to completion and write `<logs>/<run_id>/run.json`.
    ///
    /// Workflow failures end up in the record, not in the returned error.
    pub async fn run(&self, workflow: Workflow, cancel: &CancellationToken) -> Result<RunOutcome> {
        let run_id = new_run_id();
        let run_dir = unused_run_dir(&self.logs_dir, &run_id);
        let mut logger = RunLogger::new(run_dir.clone());
        if let Some(sink) = &self.sink {
            logger = logger.with_sink(sink.clone());
        }
        self.describe(workflow, &run_id, &mut logger);
        info!(run_id = %run_id, mode = workflow.mode(), "Workflow starting");

        let outcome = {
            let mut seq = Sequencer::new(&self.adb, &mut logger, cancel);
            match workflow {
                Workflow::Forensic => {
                    let params = ExtractionParams::from_config(
                        &self.config.forensic,
                        self.config.forensic.root_mode,
                        run_dir.join(ARTIFACTS_DIR),
                    );
                    run_extraction(&mut seq, &params).await
                }
                Workflow::Traceability => {
                    let params = TraceabilityParams::from_config(
                        &self.config.offensive,
                        &self.config.forensic,
                    );
                    run_traceability_check(&mut seq, &params).await
                }
                Workflow::Offensive => {
                    let params = SimulationParams::from_config(&self.config.offensive, &run_id, false);
                    run_simulation(&mut seq, &params).await
                }
            }
        };

        let (status, error) = resolve_outcome(outcome, cancel);
        let (run_json, record) = logger.write(status, error)?;
        info!(run_id = %run_id, status = %record.status, elapsed_s = record.elapsed_s, "Workflow finished");
        Ok(RunOutcome { run_json, record })
    }

    /// Stock versus rooted differential run.
    pub async fn compare(&self, cancel: &CancellationToken) -> Result<ComparisonOutcome> {
        compare::run_comparison(&self.adb, &self.config, &self.logs_dir, self.sink.clone(), cancel)
            .await
    }
}

/// A workflow running on a background task.
pub struct WorkflowHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<RunOutcome>>,
}

impl WorkflowHandle {
    /// Request cancellation; observed before the next step starts.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn join(self) -> Result<RunOutcome> {
        self.task.await.context("workflow task panicked")?
    }
}

/// Start `workflow` in the background once a device is confirmed attached.
pub async fn spawn_workflow(driver: Arc<Driver>, workflow: Workflow) -> Result<WorkflowHandle> {
    driver.ensure_device_attached().await?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move { driver.run(workflow, &token).await });
    Ok(WorkflowHandle { cancel, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::ScriptedRunner;

    fn driver(runner: Arc<ScriptedRunner>, logs: &std::path::Path) -> Driver {
        Driver::new(Adb::new(runner, "R58M123", "adb"), AppConfig::default()).with_logs_dir(logs)
    }

    #[test]
    fn test_run_id_format() {
        let id = new_run_id();
        assert_eq!(id.len(), 16);
        assert!(id.ends_with('Z'));
        assert_eq!(&id[8..9], "T");
    }

    #[test]
    fn test_run_dir_is_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let first = unused_run_dir(dir.path(), "20260101T120000Z");
        std::fs::create_dir_all(&first).unwrap();
        let second = unused_run_dir(dir.path(), "20260101T120000Z");
        assert_eq!(second, dir.path().join("20260101T120000Z-2"));
    }

    #[tokio::test]
    async fn test_cancel_before_first_step() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = driver(runner.clone(), dir.path())
            .run(Workflow::Offensive, &cancel)
            .await
            .unwrap();
        assert_eq!(out.record.status, RunStatus::Cancelled);
        assert!(out.record.steps.is_empty());
        assert!(out.record.error.is_none());
        assert!(runner.calls().is_empty());
        assert!(out.run_json.exists());
    }

    #[tokio::test]
    async fn test_first_call_failure_records_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default().reply("devices", 1, "", "daemon not running"));
        let cancel = CancellationToken::new();

        let out = driver(runner.clone(), dir.path())
            .run(Workflow::Forensic, &cancel)
            .await
            .unwrap();
        assert_eq!(out.record.status, RunStatus::Error);
        assert_eq!(out.record.steps.len(), 1);
        assert!(!out.record.steps[0].ok);
        assert_eq!(out.record.error.as_deref(), Some("adb_devices failed: daemon not running"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_success_writes_meta() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let out = driver(runner, dir.path())
            .run(Workflow::Forensic, &CancellationToken::new())
            .await
            .unwrap();
        let loaded = RunRecord::load(&out.run_json).unwrap();
        assert_eq!(loaded.status, RunStatus::Success);
        assert_eq!(loaded.meta_str("mode"), "forensic");
        assert_eq!(loaded.meta["gpio_pins"]["cancel"], 27);
        assert!(loaded.steps.iter().all(|s| s.ok));
    }

    #[tokio::test]
    async fn test_spawn_refuses_without_device() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::default().reply("devices", 0, "List of devices attached\nR58M123\tunauthorized", ""),
        );
        let err = spawn_workflow(Arc::new(driver(runner, dir.path())), Workflow::Offensive)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("No authorised ADB device"));
    }

    #[tokio::test]
    async fn test_spawned_run_can_be_joined() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::default().reply("devices", 0, "List of devices attached\nR58M123\tdevice usb:1-1", ""),
        );
        let handle = spawn_workflow(Arc::new(driver(runner, dir.path())), Workflow::Offensive)
            .await
            .unwrap();
        let out = handle.join().await.unwrap();
        assert_eq!(out.record.status, RunStatus::Success);
        assert_eq!(out.record.meta_str("trace_token"), out.record.meta_str("run_id"));
    }
}
