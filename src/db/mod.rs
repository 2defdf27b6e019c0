//! Database module: the idempotent loader and the backfill run log.
//!
//! - `loader`: multi-row upserts into raw entity tables.
//! - `runlog`: start/complete markers for each backfill run.
//! - `model`: rows returned by the run log queries.
//!
//! The run log writes through the pool directly and never joins a loader
//! transaction, so a rolled-back batch still leaves its failure record.

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub mod loader;
pub mod model;
pub mod runlog;

pub use loader::{count_records, ensure_raw_table, upsert_records, validate_table_name};
pub use model::{BackfillLogEntry, RunCompletion};
pub use runlog::{fetch_run, log_complete, log_start, recent_runs};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&normalized)
        .await?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// For file-backed SQLite URLs: expand a leading `~/`, make sure the parent
/// directory exists, and ask SQLite to create the file. In-memory and
/// non-SQLite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{path}?{query}")
}
