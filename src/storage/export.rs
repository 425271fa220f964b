//! Optional downstream export of the results tables.

use super::store::{EasyReadRow, Summary};
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Receives a snapshot of the results tables after every change.
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;
    fn export(&self, summary: &Summary, rows: &[EasyReadRow]) -> Result<()>;
}

/// Writes the summary and easy-read table as a Markdown document.
pub struct MarkdownExporter {
    path: PathBuf,
}

impl MarkdownExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Exporter for MarkdownExporter {
    fn name(&self) -> &str {
        "markdown"
    }

    fn export(&self, summary: &Summary, rows: &[EasyReadRow]) -> Result<()> {
        let body = render_markdown(summary, rows);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("md.tmp");
        std::fs::write(&tmp, body)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

fn cell(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}

pub fn render_markdown(summary: &Summary, rows: &[EasyReadRow]) -> String {
    let mut out = String::from("# ByteBite Results\n\n");
    out.push_str(&format!("Updated: {}\n\n", summary.last_updated_utc));
    out.push_str("| Metric | Value |\n|---|---|\n");
    out.push_str(&format!("| Total runs | {} |\n", summary.total_runs));
    out.push_str(&format!("| Successful runs | {} |\n", summary.successes));
    out.push_str(&format!("| Success rate | {:.2}% |\n", summary.success_rate_pct));
    out.push_str(&format!("| Mean duration | {:.3}s |\n", summary.mean_elapsed_s));
    out.push_str(&format!("| Median duration | {:.3}s |\n", summary.median_elapsed_s));

    if !summary.bottlenecks.is_empty() {
        out.push_str("\n## Slowest steps\n\n");
        out.push_str("| Step | Mean ms | Max ms | Samples | Failures | Present in |\n");
        out.push_str("|---|---|---|---|---|---|\n");
        for b in &summary.bottlenecks {
            out.push_str(&format!(
                "| {} | {:.2} | {:.0} | {} | {} | {:.1}% |\n",
                cell(&b.step),
                b.mean_ms,
                b.max_ms,
                b.samples,
                b.failure_count,
                b.presence_pct
            ));
        }
    }

    out.push_str("\n## Runs\n\n");
    out.push_str("| Run | Test | Result | Duration (s) | Passed | Failed | Main issue |\n");
    out.push_str("|---|---|---|---|---|---|---|\n");
    for r in rows {
        out.push_str(&format!(
            "| {} | {} | {} | {:.3} | {} | {} | {} |\n",
            cell(&r.run_id),
            cell(&r.test_type),
            cell(&r.result),
            r.duration_s,
            r.steps_passed,
            r.steps_failed,
            cell(&r.main_issue)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StepStats;

    fn summary() -> Summary {
        Summary {
            last_updated_utc: "2026-01-01T00:00:00+00:00".into(),
            total_runs: 2,
            successes: 1,
            success_rate_pct: 50.0,
            mean_elapsed_s: 1.5,
            median_elapsed_s: 1.5,
            bottlenecks: vec![StepStats {
                step: "pull_apk_1".into(),
                mean_ms: 812.5,
                max_ms: 900.0,
                samples: 2,
                failure_count: 0,
                presence_pct: 100.0,
            }],
        }
    }

    #[test]
    fn test_markdown_escapes_pipes() {
        let rows = [EasyReadRow {
            logged_utc: String::new(),
            run_id: "r1".into(),
            test_type: "Forensic Test".into(),
            result: "Error".into(),
            duration_s: 2.0,
            steps_passed: 3,
            steps_failed: 1,
            main_issue: "a|b".into(),
            run_file: String::new(),
        }];
        let md = render_markdown(&summary(), &rows);
        assert!(md.contains("| Success rate | 50.00% |"));
        assert!(md.contains("| pull_apk_1 | 812.50 | 900 | 2 | 0 | 100.0% |"));
        assert!(md.contains("a\\|b"));
    }

    #[test]
    fn test_markdown_exporter_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results.md");
        MarkdownExporter::new(&path).export(&summary(), &[]).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# ByteBite Results"));
    }

    #[test]
    fn test_markdown_layout_without_bottlenecks() {
        let mut s = summary();
        s.bottlenecks.clear();
        let md = render_markdown(&s, &[]);
        assert!(md.starts_with(
            "# ByteBite Results\n\nUpdated: 2026-01-01T00:00:00+00:00\n\n| Metric | Value |\n|---|---|\n"
        ));
        assert!(!md.contains("## Slowest steps"));
        assert!(md.ends_with("| Main issue |\n|---|---|---|---|---|---|---|\n"));
    }
}
