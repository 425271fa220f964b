//! Controlled, non-destructive offensive simulation.

use super::{Action, Flow, PlannedStep, Sequencer, WorkflowError};
use crate::config::OffensiveConfig;
use std::path::PathBuf;
use tracing::info;

pub const DEFAULT_TRACE_TOKEN: &str = "bytebite-unknown";
pub const ROOT_PROBE_FILE: &str = "/data/local/tmp/bytebite_root_probe.txt";
const FINAL_LOGCAT_LINES: u32 = 200;

/// Parameters for [`run_simulation`].
#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub marker_dir: String,
    pub marker_file: String,
    pub trace_tag: String,
    pub trace_token: String,
    pub open_url: String,
    pub apk_path: Option<PathBuf>,
    pub test_package: String,
    pub test_activity: String,
    pub collect_network: bool,
    /// Adds superuser probes for differential runs.
    pub root_mode: bool,
}

impl SimulationParams {
    pub fn from_config(cfg: &OffensiveConfig, trace_token: &str, root_mode: bool) -> Self {
        let apk = cfg.test_apk_path.trim();
        Self {
            marker_dir: cfg.marker_dir.clone(),
            marker_file: cfg.marker_file.clone(),
            trace_tag: cfg.trace_tag.clone(),
            trace_token: trace_token.to_string(),
            open_url: cfg.open_url.clone(),
            apk_path: (!apk.is_empty()).then(|| PathBuf::from(apk)),
            test_package: cfg.test_package.trim().to_string(),
            test_activity: cfg.test_activity.trim().to_string(),
            collect_network: cfg.collect_network,
            root_mode,
        }
    }

    pub fn token(&self) -> &str {
        match self.trace_token.trim() {
            "" => DEFAULT_TRACE_TOKEN,
            t => t,
        }
    }

    pub fn marker_path(&self) -> String {
        format!("{}/{}", self.marker_dir.trim_end_matches('/'), self.marker_file)
    }

    /// The full ordered step list for these parameters.
    pub fn plan(&self) -> Vec<PlannedStep> {
        let token = self.token();
        let marker_path = self.marker_path();

        let mut plan = vec![
            PlannedStep::logged("adb_devices", Action::Devices),
            PlannedStep::logged("wait_for_device", Action::WaitForDevice),
            PlannedStep::logged("clear_logcat", Action::ClearLogcat),
            PlannedStep::required("ensure_marker_dir", Action::EnsureDir(self.marker_dir.clone())),
            PlannedStep::required(
                "write_marker",
                Action::WriteMarker {
                    dir: self.marker_dir.clone(),
                    file: self.marker_file.clone(),
                    content: format!("ByteBite controlled simulation marker trace_token={}", token),
                },
            ),
            PlannedStep::logged(
                "write_trace_log",
                Action::WriteTraceLog {
                    tag: self.trace_tag.clone(),
                    message: format!("trace_token={} marker={}", token, marker_path),
                },
            ),
        ];

        if let Some(apk) = &self.apk_path {
            plan.push(PlannedStep::logged("install_test_apk", Action::InstallApk(apk.clone())));
        }
        if !self.test_package.is_empty() {
            plan.push(PlannedStep::logged(
                "launch_test_package",
                Action::Launch {
                    package: self.test_package.clone(),
                    activity: self.test_activity.clone(),
                },
            ));
        }
        plan.push(PlannedStep::logged("open_url", Action::OpenUrl(self.open_url.clone())));
        if self.collect_network {
            plan.push(PlannedStep::logged(
                "network_snapshot",
                Action::NetworkSnapshot { root: false },
            ));
        }
        if self.root_mode {
            plan.push(PlannedStep::logged("root_probe_id", Action::SuShell("id".into())));
            plan.push(PlannedStep::logged(
                "root_probe_write",
                Action::SuShell(format!(
                    "printf '%s\\n' root_probe_ok > {f} && ls -l {f}",
                    f = ROOT_PROBE_FILE
                )),
            ));
        }
        plan.push(PlannedStep::logged(
            "collect_logcat",
            Action::DumpLogcat(FINAL_LOGCAT_LINES),
        ));
        plan
    }
}

/// Execute the simulation sequence. Root probes are fail-fast like every
/// other step.
pub async fn run_simulation(
    seq: &mut Sequencer<'_>,
    params: &SimulationParams,
) -> Result<Flow, WorkflowError> {
    info!(token = %params.token(), root = params.root_mode, "Controlled simulation starting");
    seq.run_plan(&params.plan()).await
}
