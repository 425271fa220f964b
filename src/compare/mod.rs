//! Stock versus rooted differential runs.
//!
//! Each phase runs the offensive simulation and then forensic extraction into
//! one run record, with step names namespaced `offensive:` and `forensic:`.
//! The rooted phase only executes when superuser access is confirmed,
//! configuration allows it and the comparison was not cancelled. Otherwise it
//! is recorded as skipped and the delta stays empty.

use crate::config::AppConfig;
use crate::device::Adb;
use crate::driver::{new_run_id, resolve_outcome, unused_run_dir, ARTIFACTS_DIR};
use crate::profiles::forensic::{
    run_extraction, ExtractionParams, HASH_STEP_PREFIX, PULL_STEP_PREFIX, ROOT_ONLY_STEPS,
};
use crate::profiles::offensive::{run_simulation, SimulationParams};
use crate::profiles::{Flow, Sequencer, WorkflowError};
use crate::runlog::{RunLogger, RunRecord, RunSink, RunStatus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const STOCK_PHASE: &str = "stock";
pub const ROOTED_PHASE: &str = "rooted";
pub const COMPARISON_FILE: &str = "comparison.json";

const SKIP_NO_SU: &str = "Root phase skipped: su not available";
const SKIP_DISABLED: &str = "Root phase disabled by configuration";
const SKIP_CANCELLED: &str = "Root phase not run: comparison cancelled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBrief {
    pub ok: bool,
    pub duration_ms: u64,
}

/// Statistics for one phase record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub phase: String,
    pub run_json: Option<PathBuf>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub elapsed_s: f64,
    pub steps_total: usize,
    pub steps_failed: usize,
    pub steps_by_name: BTreeMap<String, StepBrief>,
    pub root_only_success_count: usize,
    pub apk_hash_count: usize,
    pub apk_pull_count: usize,
}

/// Step name without its profile namespace.
fn base_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

impl PhaseStats {
    pub fn from_record(phase: &str, run_json: Option<PathBuf>, record: &RunRecord) -> Self {
        let steps = &record.steps;
        let count = |pred: &dyn Fn(&str, bool) -> bool| {
            steps
                .iter()
                .filter(|s| pred(base_name(&s.name), s.ok))
                .count()
        };
        Self {
            phase: phase.to_string(),
            run_json,
            status: record.status,
            error: record.error.clone(),
            elapsed_s: record.elapsed_s,
            steps_total: steps.len(),
            steps_failed: record.failed_steps(),
            steps_by_name: steps
                .iter()
                .filter(|s| !s.name.is_empty())
                .map(|s| {
                    (
                        s.name.clone(),
                        StepBrief {
                            ok: s.ok,
                            duration_ms: s.duration_ms,
                        },
                    )
                })
                .collect(),
            root_only_success_count: count(&|name, ok| ok && ROOT_ONLY_STEPS.contains(&name)),
            apk_hash_count: count(&|name, _| name.starts_with(HASH_STEP_PREFIX)),
            apk_pull_count: count(&|name, _| name.starts_with(PULL_STEP_PREFIX)),
        }
    }

    /// The phase executed at least one step.
    pub fn ran(&self) -> bool {
        self.status != RunStatus::Skipped && self.steps_total > 0
    }
}

/// Rooted minus stock. Every field is `None` unless both phases ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub elapsed_s: Option<f64>,
    pub failed_steps: Option<i64>,
    pub root_only_success_gain: Option<i64>,
    pub apk_hash_count_gain: Option<i64>,
    pub apk_pull_count_gain: Option<i64>,
}

impl Delta {
    pub fn between(stock: &PhaseStats, rooted: &PhaseStats) -> Self {
        if !stock.ran() || !rooted.ran() {
            return Self::default();
        }
        let gain = |r: usize, s: usize| Some(r as i64 - s as i64);
        Self {
            elapsed_s: Some(((rooted.elapsed_s - stock.elapsed_s) * 1000.0).round() / 1000.0),
            failed_steps: gain(rooted.steps_failed, stock.steps_failed),
            root_only_success_gain: gain(
                rooted.root_only_success_count,
                stock.root_only_success_count,
            ),
            apk_hash_count_gain: gain(rooted.apk_hash_count, stock.apk_hash_count),
            apk_pull_count_gain: gain(rooted.apk_pull_count, stock.apk_pull_count),
        }
    }
}

/// The `comparison.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub run_id: String,
    pub root_available: bool,
    pub run_root_phase: bool,
    pub stock: PhaseStats,
    pub rooted: PhaseStats,
    pub delta: Delta,
}

#[derive(Debug, Clone)]
pub struct ComparisonOutcome {
    pub path: PathBuf,
    pub result: ComparisonResult,
}

pub fn phase_token(run_id: &str, phase: &str) -> String {
    format!("{}-{}", run_id, phase)
}

fn phase_meta(run_id: &str, phase: &str, root_mode: bool) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("run_id".into(), json!(run_id));
    meta.insert("mode".into(), json!("comparison_phase"));
    meta.insert("phase".into(), json!(phase));
    meta.insert("profile".into(), json!("comparison"));
    meta.insert("root_mode".into(), json!(root_mode));
    meta.insert("trace_token".into(), json!(phase_token(run_id, phase)));
    meta.insert("offensive_profile".into(), json!("capability_profile"));
    meta.insert("forensic_profile".into(), json!("independent_extraction"));
    meta
}

async fn run_profiles(
    adb: &Adb,
    logger: &mut RunLogger,
    cancel: &CancellationToken,
    offensive: &SimulationParams,
    forensic: &ExtractionParams,
) -> Result<Flow, WorkflowError> {
    let mut seq = Sequencer::new(adb, logger, cancel).with_prefix("offensive");
    if run_simulation(&mut seq, offensive).await? == Flow::Cancelled {
        return Ok(Flow::Cancelled);
    }
    let mut seq = Sequencer::new(adb, logger, cancel).with_prefix("forensic");
    run_extraction(&mut seq, forensic).await
}

#[allow(clippy::too_many_arguments)]
async fn run_phase(
    adb: &Adb,
    cfg: &AppConfig,
    compare_dir: &Path,
    run_id: &str,
    phase: &str,
    root_mode: bool,
    sink: Option<Arc<dyn RunSink>>,
    cancel: &CancellationToken,
) -> Result<PhaseStats> {
    let phase_dir = compare_dir.join(phase);
    let mut logger = RunLogger::new(phase_dir.clone());
    if let Some(sink) = sink {
        logger = logger.with_sink(sink);
    }
    for (key, value) in phase_meta(run_id, phase, root_mode) {
        logger.set_meta(&key, value);
    }

    let offensive =
        SimulationParams::from_config(&cfg.offensive, &phase_token(run_id, phase), root_mode);
    let forensic =
        ExtractionParams::from_config(&cfg.forensic, root_mode, phase_dir.join(ARTIFACTS_DIR));

    info!(phase, root_mode, "Comparison phase starting");
    let outcome = run_profiles(adb, &mut logger, cancel, &offensive, &forensic).await;
    let (status, error) = resolve_outcome(outcome, cancel);
    let (run_json, record) = logger.write(status, error)?;
    Ok(PhaseStats::from_record(phase, Some(run_json), &record))
}

/// Probe superuser once, run the stock phase, run or skip the rooted phase,
/// and write `<logs>/<run_id>-compare/comparison.json`. A directory already
/// used by an earlier comparison gets a numeric suffix.
pub async fn run_comparison(
    adb: &Adb,
    cfg: &AppConfig,
    logs_dir: &Path,
    sink: Option<Arc<dyn RunSink>>,
    cancel: &CancellationToken,
) -> Result<ComparisonOutcome> {
    let run_id = new_run_id();
    let compare_dir = unused_run_dir(logs_dir, &format!("{}-compare", run_id));
    std::fs::create_dir_all(&compare_dir)
        .with_context(|| format!("failed to create {}", compare_dir.display()))?;

    let probe = adb.su_id().await;
    let root_available = probe.ok() && probe.stdout.contains("uid=0");
    let run_root_phase = cfg.comparison.run_root_phase;
    info!(run_id = %run_id, root_available, run_root_phase, "Comparison starting");

    let stock = run_phase(
        adb,
        cfg,
        &compare_dir,
        &run_id,
        STOCK_PHASE,
        false,
        sink.clone(),
        cancel,
    )
    .await?;

    let rooted = if run_root_phase && root_available && !cancel.is_cancelled() {
        run_phase(adb, cfg, &compare_dir, &run_id, ROOTED_PHASE, true, sink, cancel).await?
    } else {
        let reason = if !run_root_phase {
            SKIP_DISABLED
        } else if !root_available {
            SKIP_NO_SU
        } else {
            SKIP_CANCELLED
        };
        info!(reason, "Rooted phase not executed");
        let record = RunRecord::skipped(phase_meta(&run_id, ROOTED_PHASE, true), reason);
        PhaseStats::from_record(ROOTED_PHASE, None, &record)
    };

    let result = ComparisonResult {
        run_id,
        root_available,
        run_root_phase,
        delta: Delta::between(&stock, &rooted),
        stock,
        rooted,
    };

    let path = compare_dir.join(COMPARISON_FILE);
    let body = serde_json::to_string_pretty(&result)?;
    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), stock = %result.stock.status, rooted = %result.rooted.status, "Comparison saved");

    Ok(ComparisonOutcome { path, result })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::ScriptedRunner;
    use crate::runlog::Step;

    fn step(name: &str, ok: bool) -> Step {
        Step {
            name: name.to_string(),
            ok,
            duration_ms: 5,
            details: None,
            error: None,
        }
    }

    #[test]
    fn test_stats_match_namespaced_names() {
        let mut record = RunRecord::skipped(Map::new(), "x");
        record.status = RunStatus::Success;
        record.error = None;
        record.steps = vec![
            step("offensive:root_probe_id", true),
            step("offensive:root_probe_write", false),
            step("forensic:hash_remote_apk_1", true),
            step("forensic:pull_apk_1", true),
            step("forensic:network_snapshot_root", true),
        ];
        let stats = PhaseStats::from_record(ROOTED_PHASE, None, &record);
        assert_eq!(stats.root_only_success_count, 2);
        assert_eq!(stats.apk_hash_count, 1);
        assert_eq!(stats.apk_pull_count, 1);
        assert_eq!(stats.steps_failed, 1);
        assert!(stats.steps_by_name.contains_key("offensive:root_probe_id"));
    }

    #[tokio::test]
    async fn test_no_su_skips_rooted_phase() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default().reply("su -c id", 1, "", "/system/bin/sh: su: not found"));
        let adb = Adb::new(runner, "", "adb");

        let out = run_comparison(&adb, &AppConfig::default(), dir.path(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!out.result.root_available);
        assert_eq!(out.result.stock.status, RunStatus::Success);
        assert_eq!(out.result.rooted.status, RunStatus::Skipped);
        assert_eq!(out.result.rooted.error.as_deref(), Some(SKIP_NO_SU));
        assert_eq!(out.result.delta, Delta::default());
        assert!(out.result.stock.steps_by_name.contains_key("forensic:adb_devices"));

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&out.path).unwrap()).unwrap();
        for key in ["elapsed_s", "failed_steps", "root_only_success_gain", "apk_hash_count_gain", "apk_pull_count_gain"] {
            assert!(doc["delta"][key].is_null(), "{}", key);
        }
        let stock_json = out.result.stock.run_json.as_ref().unwrap();
        assert!(stock_json.ends_with("stock/run.json"));
        assert!(!out.path.parent().unwrap().join(ROOTED_PHASE).exists());
    }

    #[tokio::test]
    async fn test_rooted_phase_runs_with_su() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default().reply("su -c id", 0, "uid=0(root) gid=0(root)", ""));
        let adb = Adb::new(runner.clone(), "", "adb");

        let out = run_comparison(&adb, &AppConfig::default(), dir.path(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.result.rooted.status, RunStatus::Success);
        assert_eq!(out.result.stock.root_only_success_count, 0);
        assert_eq!(out.result.rooted.root_only_success_count, 3);
        assert_eq!(out.result.delta.root_only_success_gain, Some(3));
        assert_eq!(out.result.delta.failed_steps, Some(0));

        let token = phase_token(&out.result.run_id, ROOTED_PHASE);
        assert!(runner.shell_commands().iter().any(|c| c.contains(&token)));
    }

    #[tokio::test]
    async fn test_rooted_phase_disabled_by_config() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default().reply("su -c id", 0, "uid=0(root)", ""));
        let adb = Adb::new(runner, "", "adb");
        let mut cfg = AppConfig::default();
        cfg.comparison.run_root_phase = false;

        let out = run_comparison(&adb, &cfg, dir.path(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.result.root_available);
        assert_eq!(out.result.rooted.status, RunStatus::Skipped);
        assert_eq!(out.result.rooted.error.as_deref(), Some(SKIP_DISABLED));
        assert!(out.result.delta.elapsed_s.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_comparison_leaves_delta_empty() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default().reply("su -c id", 0, "uid=0(root)", ""));
        let adb = Adb::new(runner, "", "adb");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = run_comparison(&adb, &AppConfig::default(), dir.path(), None, &cancel)
            .await
            .unwrap();

        assert!(out.result.root_available);
        assert_eq!(out.result.stock.status, RunStatus::Cancelled);
        assert_eq!(out.result.stock.steps_total, 0);
        assert_eq!(out.result.rooted.status, RunStatus::Skipped);
        assert_eq!(out.result.rooted.error.as_deref(), Some(SKIP_CANCELLED));
        assert!(out.result.rooted.run_json.is_none());
        assert_eq!(out.result.delta, Delta::default());

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&out.path).unwrap()).unwrap();
        for key in ["elapsed_s", "failed_steps", "root_only_success_gain", "apk_hash_count_gain", "apk_pull_count_gain"] {
            assert!(doc["delta"][key].is_null(), "{}", key);
        }
        assert!(!out.path.parent().unwrap().join(ROOTED_PHASE).exists());
    }

    #[test]
    fn test_delta_needs_steps_in_both_phases() {
        let mut ran = RunRecord::skipped(Map::new(), "x");
        ran.status = RunStatus::Success;
        ran.error = None;
        ran.steps = vec![step("forensic:adb_devices", true)];
        let mut empty = ran.clone();
        empty.status = RunStatus::Cancelled;
        empty.steps.clear();

        let stock = PhaseStats::from_record(STOCK_PHASE, None, &empty);
        let rooted = PhaseStats::from_record(ROOTED_PHASE, None, &ran);
        assert_eq!(Delta::between(&stock, &rooted), Delta::default());

        let stock = PhaseStats::from_record(STOCK_PHASE, None, &ran);
        assert_eq!(Delta::between(&stock, &rooted).failed_steps, Some(0));
    }

    #[tokio::test]
    async fn test_back_to_back_comparisons_keep_separate_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default().reply("su -c id", 1, "", "su: not found"));
        let adb = Adb::new(runner, "", "adb");

        let first = run_comparison(&adb, &AppConfig::default(), dir.path(), None, &CancellationToken::new())
            .await
            .unwrap();
        // Pre-create the next directory so the second run collides even across a second boundary.
        let run_id = new_run_id();
        std::fs::create_dir_all(dir.path().join(format!("{}-compare", run_id))).unwrap();
        let second = run_comparison(&adb, &AppConfig::default(), dir.path(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_ne!(first.path, second.path);
        assert!(first.path.exists());
        assert!(second.path.exists());
        assert_ne!(first.result.stock.run_json, second.result.stock.run_json);
        assert!(first.result.stock.run_json.as_ref().unwrap().exists());
    }
}
