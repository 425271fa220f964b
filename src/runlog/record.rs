//! The serialized run document (`run.json`).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

/// Terminal state of one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Cancelled,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Skipped => "skipped",
        }
    }

    /// Label for the human-readable results table.
    pub fn friendly(&self) -> &'static str {
        match self {
            RunStatus::Success => "Success",
            RunStatus::Error => "Error",
            RunStatus::Cancelled => "Cancelled",
            RunStatus::Skipped => "Skipped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub ok: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One finalized workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub meta: Map<String, Value>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub elapsed_s: f64,
    pub started_utc: DateTime<Utc>,
    pub ended_utc: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl RunRecord {
    /// A record for a run that was never executed.
    pub fn skipped(meta: Map<String, Value>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            meta,
            status: RunStatus::Skipped,
            error: Some(reason.into()),
            elapsed_s: 0.0,
            started_utc: now,
            ended_utc: now,
            steps: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read run record: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse run record: {}", path.display()))
    }

    /// String value of a meta key, or empty.
    pub fn meta_str(&self, key: &str) -> String {
        match self.meta.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }

    pub fn passed_steps(&self) -> usize {
        self.steps.len() - self.failed_steps()
    }

    /// The top-level error, else the first failed step.
    pub fn main_issue(&self) -> String {
        if let Some(err) = self.error.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            return err.to_string();
        }
        match self.steps.iter().find(|s| !s.ok) {
            Some(step) => {
                let name = if step.name.is_empty() { "unknown_step" } else { &step.name };
                match step.error.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
                    Some(err) => format!("{}: {}", name, err),
                    None => format!("{} failed", name),
                }
            }
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RunRecord {
        let mut meta = Map::new();
        meta.insert("run_id".into(), json!("20260101T120000Z"));
        meta.insert("mode".into(), json!("forensic"));
        meta.insert("logcat_tail".into(), json!(1000));
        RunRecord {
            meta,
            status: RunStatus::Error,
            error: Some("collect_logcat failed: boom".into()),
            elapsed_s: 2.5,
            started_utc: "2026-01-01T12:00:00.123456Z".parse().unwrap(),
            ended_utc: "2026-01-01T12:00:02.623456Z".parse().unwrap(),
            steps: vec![
                Step {
                    name: "adb_devices".into(),
                    ok: true,
                    duration_ms: 12,
                    details: Some(json!({"returncode": 0, "stdout": "List of devices"})),
                    error: None,
                },
                Step {
                    name: "collect_logcat".into(),
                    ok: false,
                    duration_ms: 40,
                    details: Some(json!({"returncode": 1, "stderr": "boom"})),
                    error: Some("collect_logcat failed with return code 1".into()),
                },
            ],
        }
    }

    #[test]
    fn test_round_trip_is_field_for_field_equal() {
        let record = sample();
        let text = serde_json::to_string_pretty(&record).unwrap();
        let back: RunRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn test_document_shape() {
        let v = serde_json::to_value(sample()).unwrap();
        assert_eq!(v["status"], "error");
        assert!(v["elapsed_s"].is_number());
        assert!(v["started_utc"].as_str().unwrap().ends_with('Z'));
        let first = v["steps"][0].as_object().unwrap();
        assert!(!first.contains_key("error"));

        let mut ok = sample();
        ok.error = None;
        let v = serde_json::to_value(ok).unwrap();
        assert!(v["error"].is_null());
    }

    #[test]
    fn test_main_issue_prefers_top_level_error() {
        let mut r = sample();
        assert_eq!(r.main_issue(), "collect_logcat failed: boom");
        r.error = None;
        assert_eq!(r.main_issue(), "collect_logcat: collect_logcat failed with return code 1");
        r.steps[1].error = None;
        assert_eq!(r.main_issue(), "collect_logcat failed");
        r.steps[1].ok = true;
        assert_eq!(r.main_issue(), "");
    }

    #[test]
    fn test_skipped_record() {
        let r = RunRecord::skipped(Map::new(), "Root phase skipped: su not available");
        assert_eq!(r.status, RunStatus::Skipped);
        assert!(r.steps.is_empty());
        assert_eq!(serde_json::to_value(&r).unwrap()["status"], "skipped");
    }
}
