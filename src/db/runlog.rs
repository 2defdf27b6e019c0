use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{info, instrument};

use super::model::{BackfillLogEntry, RunCompletion};
use super::Pool;
use crate::error::LoadError;
use crate::model::BackfillStatus;

const ENTRY_COLUMNS: &str = "id, entity_name, window_start, window_end, status, records_read, \
     records_inserted, records_updated, pages_processed, duration_seconds, error_message, \
     started_at, completed_at";

/// Open a `running` entry and return its id.
#[instrument(skip_all, fields(entity = %entity_name))]
pub async fn log_start(
    pool: &Pool,
    entity_name: &str,
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
) -> Result<i64, LoadError> {
    let id: i64 = sqlx::query(
        "INSERT INTO backfill_log (entity_name, window_start, window_end, status, started_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(entity_name)
    .bind(window_start)
    .bind(window_end)
    .bind(BackfillStatus::Running.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?
    .try_get("id")?;
    info!(log_id = id, "backfill started");
    Ok(id)
}

/// Write the terminal status of a running entry. An entry that already
/// finished is left untouched.
#[instrument(skip_all, fields(log_id = log_id, status = completion.status.as_str()))]
pub async fn log_complete(
    pool: &Pool,
    log_id: i64,
    completion: &RunCompletion,
) -> Result<(), LoadError> {
    let result = sqlx::query(
        "UPDATE backfill_log SET status = ?, records_read = ?, records_inserted = ?, \
         records_updated = ?, pages_processed = ?, duration_seconds = ?, error_message = ?, \
         completed_at = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(completion.status.as_str())
    .bind(to_i64(completion.records_read))
    .bind(to_i64(completion.records_inserted))
    .bind(to_i64(completion.records_updated))
    .bind(to_i64(completion.pages_processed))
    .bind(completion.duration_seconds)
    .bind(completion.error_message.as_deref())
    .bind(Utc::now())
    .bind(log_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM backfill_log WHERE id = ?")
            .bind(log_id)
            .fetch_optional(pool)
            .await?;
        return Err(match exists {
            Some(_) => LoadError::LogAlreadyFinished(log_id),
            None => LoadError::LogNotFound(log_id),
        });
    }
    info!(
        records_read = completion.records_read,
        inserted = completion.records_inserted,
        updated = completion.records_updated,
        "backfill log closed"
    );
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_run(pool: &Pool, log_id: i64) -> Result<Option<BackfillLogEntry>, LoadError> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM backfill_log WHERE id = ?"
    ))
    .bind(log_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(entry_from_row).transpose()
}

/// Newest entries first.
#[instrument(skip_all)]
pub async fn recent_runs(pool: &Pool, limit: u32) -> Result<Vec<BackfillLogEntry>, LoadError> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM backfill_log ORDER BY id DESC LIMIT ?"
    ))
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    rows.iter().map(entry_from_row).collect()
}

fn entry_from_row(row: &SqliteRow) -> Result<BackfillLogEntry, LoadError> {
    let status: String = row.try_get("status")?;
    let status = BackfillStatus::parse_status(&status).ok_or_else(|| {
        LoadError::Database(sqlx::Error::Decode(
            format!("unknown backfill status {status:?}").into(),
        ))
    })?;
    Ok(BackfillLogEntry {
        id: row.try_get("id")?,
        entity_name: row.try_get("entity_name")?,
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        status,
        records_read: row.try_get("records_read")?,
        records_inserted: row.try_get("records_inserted")?,
        records_updated: row.try_get("records_updated")?,
        pages_processed: row.try_get("pages_processed")?,
        duration_seconds: row.try_get("duration_seconds")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn start_then_complete() {
        let pool = setup_pool().await;
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let id = log_start(&pool, "invoices", Some(start), Some(end))
            .await
            .unwrap();

        let running = fetch_run(&pool, id).await.unwrap().unwrap();
        assert_eq!(running.status, BackfillStatus::Running);
        assert_eq!(running.window_start, Some(start));
        assert!(running.completed_at.is_none());

        log_complete(&pool, id, &RunCompletion::completed(10, 7, 3, 1, 2.5))
            .await
            .unwrap();
        let done = fetch_run(&pool, id).await.unwrap().unwrap();
        assert_eq!(done.status, BackfillStatus::Completed);
        assert_eq!(done.records_inserted, 7);
        assert_eq!(done.records_updated, 3);
        assert_eq!(done.duration_seconds, Some(2.5));
        assert!(done.completed_at.is_some());
        assert!(done.error_message.is_none());
    }

    #[tokio::test]
    async fn terminal_entries_are_not_rewritten() {
        let pool = setup_pool().await;
        let id = log_start(&pool, "items", None, None).await.unwrap();
        log_complete(&pool, id, &RunCompletion::failed(0, 0, 0, 0, 0.1, "boom"))
            .await
            .unwrap();

        let again = log_complete(&pool, id, &RunCompletion::completed(1, 1, 0, 1, 0.2)).await;
        assert!(matches!(again, Err(LoadError::LogAlreadyFinished(x)) if x == id));
        let entry = fetch_run(&pool, id).await.unwrap().unwrap();
        assert_eq!(entry.status, BackfillStatus::Failed);
        assert_eq!(entry.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_id_is_reported() {
        let pool = setup_pool().await;
        let missing = log_complete(&pool, 42, &RunCompletion::completed(0, 0, 0, 0, 0.0)).await;
        assert!(matches!(missing, Err(LoadError::LogNotFound(42))));
        assert!(fetch_run(&pool, 42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_runs_are_newest_first() {
        let pool = setup_pool().await;
        let first = log_start(&pool, "customers", None, None).await.unwrap();
        let second = log_start(&pool, "invoices", None, None).await.unwrap();
        let runs = recent_runs(&pool, 10).await.unwrap();
        let ids: Vec<i64> = runs.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(recent_runs(&pool, 1).await.unwrap().len(), 1);
    }
}
