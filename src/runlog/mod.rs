//! Step recorder and run record finalization.

pub mod record;

pub use record::{RunRecord, RunStatus, Step};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

pub const RUN_FILE: &str = "run.json";

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to write run record {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize run record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Consumer of finalized run documents.
///
/// Sink failures never fail run recording.
pub trait RunSink: Send + Sync {
    fn ingest(&self, run_json: &Path, record: &RunRecord) -> anyhow::Result<()>;
}

/// Monotonic start time of an open step.
#[derive(Debug, Clone, Copy)]
pub struct StepToken(Instant);

/// Collects steps for one run and writes the record exactly once.
pub struct RunLogger {
    run_dir: PathBuf,
    meta: Map<String, Value>,
    steps: Vec<Step>,
    started: Instant,
    started_utc: DateTime<Utc>,
    sink: Option<Arc<dyn RunSink>>,
}

impl RunLogger {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            meta: Map::new(),
            steps: Vec::new(),
            started: Instant::now(),
            started_utc: Utc::now(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.meta.insert(key.to_string(), value.into());
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    fn check_name(&self, name: &str) -> Result<(), RunLogError> {
        if name.is_empty() {
            return Err(RunLogError::InvalidArgument(
                "step name cannot be empty".to_string(),
            ));
        }
        if self.steps.iter().any(|s| s.name == name) {
            return Err(RunLogError::InvalidArgument(format!(
                "duplicate step name: {}",
                name
            )));
        }
        Ok(())
    }

    pub fn begin_step(&self, name: &str) -> Result<StepToken, RunLogError> {
        self.check_name(name)?;
        Ok(StepToken(Instant::now()))
    }

    pub fn end_step(
        &mut self,
        token: StepToken,
        name: &str,
        ok: bool,
        details: Option<Value>,
        error: Option<String>,
    ) -> Result<(), RunLogError> {
        self.check_name(name)?;
        let duration_ms = u64::try_from(token.0.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.steps.push(Step {
            name: name.to_string(),
            ok,
            duration_ms,
            details: details.filter(|d| !d.is_null()),
            error: error.filter(|e| !e.is_empty()),
        });
        Ok(())
    }

    /// Close the run in memory without writing it.
    pub fn finalize(self, status: RunStatus, error: Option<String>) -> RunRecord {
        self.into_parts(status, error).0
    }

    fn into_parts(
        self,
        status: RunStatus,
        error: Option<String>,
    ) -> (RunRecord, PathBuf, Option<Arc<dyn RunSink>>) {
        // Truncated milliseconds, same as step durations.
        let elapsed_s = self.started.elapsed().as_millis() as f64 / 1000.0;
        let record = RunRecord {
            meta: self.meta,
            status,
            error: error.filter(|e| !e.is_empty()),
            elapsed_s,
            started_utc: self.started_utc,
            ended_utc: Utc::now(),
            steps: self.steps,
        };
        (record, self.run_dir, self.sink)
    }

    /// Finalize and write `<run_dir>/run.json`, then hand the record to the
    /// sink, if any.
    pub fn write(
        self,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(PathBuf, RunRecord), RunLogError> {
        let (record, run_dir, sink) = self.into_parts(status, error);
        let out = run_dir.join(RUN_FILE);
        let body = serde_json::to_string_pretty(&record)?;
        std::fs::create_dir_all(&run_dir)
            .and_then(|_| std::fs::write(&out, body))
            .map_err(|source| RunLogError::Write {
                path: out.clone(),
                source,
            })?;
        info!(path = %out.display(), status = %record.status, steps = record.steps.len(), "Run record written");

        if let Some(sink) = sink {
            if let Err(e) = sink.ingest(&out, &record) {
                warn!(path = %out.display(), error = %e, "Results store update failed; run record kept");
            }
        }
        Ok((out, record))
    }
}
