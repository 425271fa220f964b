use super::{open_pool, Exporter, Pool};
use crate::runlog::{RunRecord, RunSink, RUN_FILE};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bottleneck rows kept in the persisted summary.
const SUMMARY_BOTTLENECKS: usize = 10;

/// Cumulative statistics across every ingested run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub last_updated_utc: String,
    pub total_runs: u64,
    pub successes: u64,
    pub success_rate_pct: f64,
    pub mean_elapsed_s: f64,
    pub median_elapsed_s: f64,
    pub bottlenecks: Vec<StepStats>,
}

/// Per-step-name timing across runs, used for bottleneck analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepStats {
    pub step: String,
    pub mean_ms: f64,
    pub max_ms: f64,
    pub samples: u64,
    pub failure_count: u64,
    pub presence_pct: f64,
}

/// One row of the human-readable table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EasyReadRow {
    pub logged_utc: String,
    pub run_id: String,
    pub test_type: String,
    pub result: String,
    pub duration_s: f64,
    pub steps_passed: u64,
    pub steps_failed: u64,
    pub main_issue: String,
    pub run_file: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub imported: usize,
    pub skipped: usize,
}

/// Idempotent projection of run records into `runs`, `steps`, `easy_read`
/// and `summary` tables, keyed by the canonical path of each `run.json`.
///
/// Assumes a single writer process.
pub struct AggregationStore {
    pool: Pool,
    exporter: Option<Box<dyn Exporter>>,
}

impl AggregationStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            exporter: None,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Opening results store");
        Ok(Self::new(open_pool(path)?))
    }

    pub fn with_exporter(mut self, exporter: Box<dyn Exporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    /// Canonical run key for a run document path.
    pub fn run_key(run_json: &Path) -> Result<String> {
        let resolved = std::fs::canonicalize(run_json)
            .with_context(|| format!("cannot resolve run record path: {}", run_json.display()))?;
        Ok(resolved.to_string_lossy().replace('\\', "/"))
    }

    /// Load and ingest a run document from disk.
    pub fn ingest_file(&self, run_json: &Path) -> Result<String> {
        let record = RunRecord::load(run_json)?;
        self.ingest(run_json, &record)
    }

    /// Replace every row for this run, recompute the summary, then export.
    pub fn ingest(&self, run_json: &Path, record: &RunRecord) -> Result<String> {
        let key = Self::run_key(run_json)?;
        {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction()?;
            upsert_run(&tx, &key, record)?;
            persist_summary(&tx)?;
            tx.commit()?;
        }
        debug!(run_key = %key, status = %record.status, "Run ingested");
        self.export();
        Ok(key)
    }

    /// Hand the current tables to the exporter. Failures only warn.
    pub fn export(&self) {
        let Some(exporter) = &self.exporter else {
            warn!("No results exporter available; export skipped");
            return;
        };
        let outcome = self
            .summary()
            .and_then(|summary| Ok((summary, self.easy_read()?)))
            .and_then(|(summary, rows)| exporter.export(&summary, &rows));
        if let Err(e) = outcome {
            warn!(exporter = exporter.name(), error = %e, "Results export failed");
        }
    }

    /// Wipe every table and re-ingest all `run.json` files below `logs_dir`.
    pub fn rebuild(&self, logs_dir: &Path) -> Result<RebuildReport> {
        let mut files = Vec::new();
        collect_run_files(logs_dir, &mut files)
            .with_context(|| format!("failed to scan {}", logs_dir.display()))?;
        files.sort();

        let mut report = RebuildReport::default();
        {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction()?;
            tx.execute_batch(
                "DELETE FROM runs; DELETE FROM steps; DELETE FROM easy_read; DELETE FROM summary;",
            )?;
            for path in &files {
                let loaded = RunRecord::load(path).and_then(|r| Ok((Self::run_key(path)?, r)));
                match loaded {
                    Ok((key, record)) => {
                        upsert_run(&tx, &key, &record)?;
                        report.imported += 1;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable run record");
                        report.skipped += 1;
                    }
                }
            }
            persist_summary(&tx)?;
            tx.commit()?;
        }
        info!(imported = report.imported, skipped = report.skipped, "Results store rebuilt");
        self.export();
        Ok(report)
    }

    pub fn summary(&self) -> Result<Summary> {
        let conn = self.pool.get()?;
        compute_summary(&conn, SUMMARY_BOTTLENECKS)
    }

    /// Slowest steps by mean duration.
    pub fn bottlenecks(&self, top: usize) -> Result<Vec<StepStats>> {
        let conn = self.pool.get()?;
        let total = count_runs(&conn)?;
        step_stats(&conn, total, top)
    }

    /// Path of the most recently ingested run document, by run id.
    pub fn latest_run(&self) -> Result<Option<PathBuf>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT run_json FROM runs ORDER BY run_id DESC, logged_utc DESC LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(PathBuf::from(row.get::<_, String>(0)?))),
            None => Ok(None),
        }
    }

    /// Human-readable rows, newest run id first.
    pub fn easy_read(&self) -> Result<Vec<EasyReadRow>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT logged_utc, run_id, test_type, result, duration_s, steps_passed,
                    steps_failed, main_issue, run_key
             FROM easy_read ORDER BY run_id DESC, run_key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EasyReadRow {
                logged_utc: row.get(0)?,
                run_id: row.get(1)?,
                test_type: row.get(2)?,
                result: row.get(3)?,
                duration_s: row.get(4)?,
                steps_passed: row.get(5)?,
                steps_failed: row.get(6)?,
                main_issue: row.get(7)?,
                run_file: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

impl RunSink for AggregationStore {
    fn ingest(&self, run_json: &Path, record: &RunRecord) -> Result<()> {
        AggregationStore::ingest(self, run_json, record).map(|_| ())
    }
}

fn collect_run_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // Does not follow symlinks.
        if entry.file_type()?.is_dir() {
            collect_run_files(&path, out)?;
        } else if path.file_name().is_some_and(|n| n == RUN_FILE) {
            out.push(path);
        }
    }
    Ok(())
}

/// Display label for the test type column.
pub fn friendly_mode(mode: &str, phase: &str) -> String {
    match mode.trim().to_lowercase().as_str() {
        "offensive" => "Offensive Test".to_string(),
        "forensic" => "Forensic Test".to_string(),
        "traceability" => "Traceability Check".to_string(),
        "comparison_phase" => {
            let p = phase.trim().to_lowercase();
            format!("Comparison ({})", if p.is_empty() { "phase" } else { &p })
        }
        "" => "Unknown".to_string(),
        _ => mode.to_string(),
    }
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

fn upsert_run(tx: &Transaction<'_>, key: &str, record: &RunRecord) -> Result<()> {
    for table in ["runs", "steps", "easy_read"] {
        tx.execute(
            &format!("DELETE FROM {} WHERE run_key = ?1", table),
            params![key],
        )?;
    }

    let now = Utc::now().to_rfc3339();
    let run_id = record.meta_str("run_id");
    let mode = record.meta_str("mode");
    let phase = record.meta_str("phase");
    let failed = record.failed_steps() as i64;

    tx.execute(
        "INSERT INTO runs (run_key, logged_utc, run_id, mode, phase, profile, status, elapsed_s,
                           step_count, failed_step_count, error, run_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            key,
            now,
            run_id,
            mode,
            phase,
            record.meta_str("profile"),
            record.status.as_str(),
            record.elapsed_s,
            record.steps.len() as i64,
            failed,
            record.error.clone().unwrap_or_default(),
            key,
        ],
    )?;

    let mut insert_step = tx.prepare(
        "INSERT INTO steps (run_key, step_index, logged_utc, run_id, mode, phase, step_name, ok,
                            duration_ms, error, details_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for (idx, step) in record.steps.iter().enumerate() {
        let details = step
            .details
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        insert_step.execute(params![
            key,
            (idx + 1) as i64,
            now,
            run_id,
            mode,
            phase,
            step.name,
            step.ok,
            i64::try_from(step.duration_ms).unwrap_or(i64::MAX),
            step.error.clone().unwrap_or_default(),
            details,
        ])?;
    }

    tx.execute(
        "INSERT INTO easy_read (run_key, logged_utc, run_id, test_type, result, duration_s,
                                steps_passed, steps_failed, main_issue)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            key,
            now,
            run_id,
            friendly_mode(&mode, &phase),
            record.status.friendly(),
            round_to(record.elapsed_s, 3),
            record.passed_steps() as i64,
            failed,
            record.main_issue(),
        ],
    )?;
    Ok(())
}

fn count_runs(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
    Ok(n as u64)
}

fn step_stats(conn: &Connection, total_runs: u64, top: usize) -> Result<Vec<StepStats>> {
    let mut stmt = conn.prepare(
        "SELECT step_name, AVG(duration_ms), MAX(duration_ms), COUNT(*),
                SUM(CASE WHEN ok = 0 THEN 1 ELSE 0 END), COUNT(DISTINCT run_key)
         FROM steps
         WHERE step_name != ''
         GROUP BY step_name
         ORDER BY AVG(duration_ms) DESC, step_name
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![top as i64], |row| {
        let seen_in: i64 = row.get(5)?;
        Ok(StepStats {
            step: row.get(0)?,
            mean_ms: round_to(row.get::<_, f64>(1)?, 2),
            max_ms: row.get::<_, i64>(2)? as f64,
            samples: row.get::<_, i64>(3)? as u64,
            failure_count: row.get::<_, i64>(4)? as u64,
            presence_pct: if total_runs > 0 {
                round_to(seen_in as f64 / total_runs as f64 * 100.0, 1)
            } else {
                0.0
            },
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn compute_summary(conn: &Connection, top: usize) -> Result<Summary> {
    let mut stmt = conn.prepare("SELECT status, elapsed_s FROM runs ORDER BY elapsed_s")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
    let mut statuses = Vec::new();
    let mut elapsed = Vec::new();
    for r in rows {
        let (status, e) = r?;
        statuses.push(status);
        elapsed.push(e);
    }

    let total = elapsed.len() as u64;
    let successes = statuses.iter().filter(|s| s.as_str() == "success").count() as u64;
    let (rate, mean, median) = if total == 0 {
        (0.0, 0.0, 0.0)
    } else {
        let n = elapsed.len();
        let median = if n % 2 == 1 {
            elapsed[n / 2]
        } else {
            (elapsed[n / 2 - 1] + elapsed[n / 2]) / 2.0
        };
        (
            successes as f64 / total as f64 * 100.0,
            elapsed.iter().sum::<f64>() / total as f64,
            median,
        )
    };

    Ok(Summary {
        last_updated_utc: Utc::now().to_rfc3339(),
        total_runs: total,
        successes,
        success_rate_pct: round_to(rate, 2),
        mean_elapsed_s: round_to(mean, 3),
        median_elapsed_s: round_to(median, 3),
        bottlenecks: step_stats(conn, total, top)?,
    })
}

fn persist_summary(tx: &Transaction<'_>) -> Result<()> {
    let summary = compute_summary(tx, SUMMARY_BOTTLENECKS)?;
    tx.execute("DELETE FROM summary", [])?;
    let mut insert = tx.prepare("INSERT INTO summary (metric, value) VALUES (?1, ?2)")?;
    let metrics = [
        ("last_updated_utc", summary.last_updated_utc.clone()),
        ("total_runs", summary.total_runs.to_string()),
        ("successes", summary.successes.to_string()),
        ("success_rate_pct", summary.success_rate_pct.to_string()),
        ("mean_elapsed_s", summary.mean_elapsed_s.to_string()),
        ("median_elapsed_s", summary.median_elapsed_s.to_string()),
        ("bottlenecks_json", serde_json::to_string(&summary.bottlenecks)?),
    ];
    for (metric, value) in metrics {
        insert.execute(params![metric, value])?;
    }
    Ok(())
}
