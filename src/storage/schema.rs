//! Results projection schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            run_key TEXT PRIMARY KEY,
            logged_utc TEXT NOT NULL,
            run_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            phase TEXT NOT NULL,
            profile TEXT NOT NULL,
            status TEXT NOT NULL,
            elapsed_s REAL NOT NULL,
            step_count INTEGER NOT NULL,
            failed_step_count INTEGER NOT NULL,
            error TEXT NOT NULL,
            run_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS steps (
            run_key TEXT NOT NULL,
            step_index INTEGER NOT NULL,
            logged_utc TEXT NOT NULL,
            run_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            phase TEXT NOT NULL,
            step_name TEXT NOT NULL,
            ok INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            error TEXT NOT NULL,
            details_json TEXT NOT NULL,
            PRIMARY KEY (run_key, step_index)
        );

        CREATE TABLE IF NOT EXISTS easy_read (
            run_key TEXT PRIMARY KEY,
            logged_utc TEXT NOT NULL,
            run_id TEXT NOT NULL,
            test_type TEXT NOT NULL,
            result TEXT NOT NULL,
            duration_s REAL NOT NULL,
            steps_passed INTEGER NOT NULL,
            steps_failed INTEGER NOT NULL,
            main_issue TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS summary (
            metric TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_runs_run_id ON runs(run_id);
        CREATE INDEX IF NOT EXISTS idx_steps_name ON steps(step_name);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}
