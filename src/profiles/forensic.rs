//! Forensic extraction and marker/logcat traceability check.

use super::{bounded, Action, Flow, PlannedStep, Sequencer, WorkflowError};
use crate::config::{ForensicConfig, OffensiveConfig};
use crate::device::adb::package_paths_from_pm_output;
use regex::Regex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::info;

/// Steps that only succeed with superuser access.
pub const ROOT_ONLY_STEPS: [&str; 3] = ["root_probe_id", "root_probe_write", "network_snapshot_root"];
pub const HASH_STEP_PREFIX: &str = "hash_remote_apk_";
pub const PULL_STEP_PREFIX: &str = "pull_apk_";

/// Parameters for [`run_extraction`].
#[derive(Debug, Clone)]
pub struct ExtractionParams {
    pub target_package: String,
    pub pull_apk: bool,
    pub collect_network: bool,
    pub root_mode: bool,
    pub logcat_tail: u32,
    /// Local directory that pulled artifacts land in.
    pub artifacts_dir: PathBuf,
}

impl ExtractionParams {
    pub fn from_config(cfg: &ForensicConfig, root_mode: bool, artifacts_dir: PathBuf) -> Self {
        Self {
            target_package: cfg.target_package.trim().to_string(),
            pull_apk: cfg.pull_apk,
            collect_network: cfg.collect_network,
            root_mode,
            logcat_tail: cfg.logcat_tail,
            artifacts_dir,
        }
    }

    fn head(&self) -> Vec<PlannedStep> {
        vec![
            PlannedStep::logged("adb_devices", Action::Devices),
            PlannedStep::logged("wait_for_device", Action::WaitForDevice),
            PlannedStep::logged("collect_logcat", Action::DumpLogcat(self.logcat_tail)),
            PlannedStep::logged("list_packages", Action::ListPackages),
        ]
    }

    fn artifacts(&self, remote_paths: &[String]) -> Vec<PlannedStep> {
        let mut plan = Vec::new();
        let stem = self.target_package.replace('.', "_");
        for (idx, remote) in remote_paths.iter().enumerate() {
            let n = idx + 1;
            plan.push(PlannedStep::logged(
                &format!("{}{}", HASH_STEP_PREFIX, n),
                Action::HashFile {
                    path: remote.clone(),
                    root: self.root_mode,
                },
            ));
            if self.pull_apk {
                plan.push(PlannedStep::logged(
                    &format!("{}{}", PULL_STEP_PREFIX, n),
                    Action::Pull {
                        remote: remote.clone(),
                        local: self.artifacts_dir.join("apks").join(format!("{}_{}.apk", stem, n)),
                    },
                ));
            }
        }
        plan
    }

    fn tail(&self) -> Vec<PlannedStep> {
        let mut plan = Vec::new();
        if self.collect_network {
            let name = if self.root_mode {
                "network_snapshot_root"
            } else {
                "network_snapshot"
            };
            plan.push(PlannedStep::logged(
                name,
                Action::NetworkSnapshot {
                    root: self.root_mode,
                },
            ));
        }
        plan.push(PlannedStep::logged("root_status", Action::RootStatus));
        plan
    }
}

/// Collect extraction artifacts: logs, package list, per-path hashes and
/// optional pulls, network state and root status.
pub async fn run_extraction(
    seq: &mut Sequencer<'_>,
    params: &ExtractionParams,
) -> Result<Flow, WorkflowError> {
    info!(package = %params.target_package, root = params.root_mode, "Forensic extraction starting");

    if seq.run_plan(&params.head()).await? == Flow::Cancelled {
        return Ok(Flow::Cancelled);
    }

    if !params.target_package.is_empty() {
        let lookup = Action::PackagePaths(params.target_package.clone());
        let Some(paths_result) = seq.run_step("package_paths", &lookup).await? else {
            return Ok(Flow::Cancelled);
        };
        let remote_paths = package_paths_from_pm_output(&paths_result.stdout);
        if remote_paths.is_empty() {
            return Err(WorkflowError::NoPackagePaths(params.target_package.clone()));
        }
        info!(count = remote_paths.len(), "Resolved package paths");
        if seq.run_plan(&params.artifacts(&remote_paths)).await? == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }
    }

    seq.run_plan(&params.tail()).await
}

/// Parameters for [`run_traceability_check`].
#[derive(Debug, Clone)]
pub struct TraceabilityParams {
    pub marker_dir: String,
    pub marker_file: String,
    pub trace_tag: String,
    pub logcat_tail: u32,
}

impl TraceabilityParams {
    pub fn from_config(offensive: &OffensiveConfig, forensic: &ForensicConfig) -> Self {
        Self {
            marker_dir: offensive.marker_dir.clone(),
            marker_file: offensive.marker_file.clone(),
            trace_tag: offensive.trace_tag.clone(),
            logcat_tail: forensic.logcat_tail,
        }
    }

    pub fn marker_path(&self) -> String {
        format!("{}/{}", self.marker_dir.trim_end_matches('/'), self.marker_file)
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"trace_token=([A-Za-z0-9._:-]+)").expect("trace token pattern is valid")
    })
}

/// Extract the token from `trace_token=<token>`, if present.
pub fn extract_trace_token(marker_text: &str) -> Option<&str> {
    token_pattern()
        .captures(marker_text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Which pieces of evidence a logcat capture is missing.
pub fn missing_evidence(logcat: &str, trace_tag: &str, token: &str) -> Vec<String> {
    let mut missing = Vec::new();
    if !logcat.contains(trace_tag) {
        missing.push(format!("trace tag '{}'", trace_tag));
    }
    if !logcat.contains(token) {
        missing.push(format!("trace token '{}'", token));
    }
    missing
}

/// Read back the on-device marker and require that its token and the trace
/// tag both appear in the system log. A marker without log corroboration
/// fails.
pub async fn run_traceability_check(
    seq: &mut Sequencer<'_>,
    params: &TraceabilityParams,
) -> Result<Flow, WorkflowError> {
    let marker_path = params.marker_path();

    let head = [
        PlannedStep::logged("adb_devices", Action::Devices),
        PlannedStep::logged("wait_for_device", Action::WaitForDevice),
    ];
    if seq.run_plan(&head).await? == Flow::Cancelled {
        return Ok(Flow::Cancelled);
    }

    let read = Action::ReadFile(marker_path.clone());
    let Some(marker) = seq.run_step("read_marker", &read).await? else {
        return Ok(Flow::Cancelled);
    };

    if marker.stdout.is_empty() {
        let err = WorkflowError::MarkerUnreadable(marker_path.clone());
        seq.record_check("validate_marker", false, None, Some(err.to_string()))?;
        return Err(err);
    }
    let Some(token) = extract_trace_token(&marker.stdout).map(str::to_string) else {
        let err = WorkflowError::MarkerTokenMissing;
        seq.record_check(
            "validate_marker",
            false,
            Some(json!({ "marker_preview": bounded(&marker.stdout, 200) })),
            Some(err.to_string()),
        )?;
        return Err(err);
    };
    seq.record_check(
        "validate_marker",
        true,
        Some(json!({ "trace_token": token, "marker_path": marker_path })),
        None,
    )?;

    let dump = Action::DumpLogcat(params.logcat_tail);
    let Some(logcat) = seq.run_step("collect_logcat", &dump).await? else {
        return Ok(Flow::Cancelled);
    };

    let missing = missing_evidence(&logcat.stdout, &params.trace_tag, &token);
    let details = json!({
        "trace_tag_found": logcat.stdout.contains(&params.trace_tag),
        "trace_token_found": logcat.stdout.contains(&token),
        "trace_token": token,
    });
    if missing.is_empty() {
        seq.record_check("validate_traceability", true, Some(details), None)?;
        return Ok(Flow::Completed);
    }

    let diagnostic = format!("missing from logcat: {}", missing.join(", "));
    seq.record_check(
        "validate_traceability",
        false,
        Some(details),
        Some(diagnostic.clone()),
    )?;
    Err(WorkflowError::TraceNotCorroborated(diagnostic))
}
