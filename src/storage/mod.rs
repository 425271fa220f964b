//! SQLite results projection -- schema, pool, idempotent run ingestion.
//!
//! The database is derived data. The `run.json` documents are the record of
//! truth and [`AggregationStore::rebuild`] can recreate every table from them.

pub mod export;
pub mod schema;
pub mod store;

pub use export::{Exporter, MarkdownExporter};
pub use store::{AggregationStore, EasyReadRow, RebuildReport, StepStats, Summary};

use anyhow::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    // One writer process is assumed; a small pool is plenty.
    let pool = R2D2Pool::builder().max_size(2).build(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}
