use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::Pool;
use crate::error::LoadError;
use crate::model::{ExtractedRecord, UpsertOutcome};

// 8 binds per row keeps a chunk well under SQLite's bind-parameter limit.
const ROWS_PER_STATEMENT: usize = 500;

static TABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid table name pattern"));

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(table: &str) -> Result<(), LoadError> {
    if TABLE_NAME.is_match(table) {
        Ok(())
    } else {
        Err(LoadError::InvalidTable(table.to_string()))
    }
}

#[instrument(skip_all, fields(table = %table))]
pub async fn ensure_raw_table(pool: &Pool, table: &str) -> Result<(), LoadError> {
    validate_table_name(table)?;
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            entity_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            extract_window_start TEXT,
            extract_window_end TEXT,
            page_number INTEGER,
            page_size INTEGER,
            request_payload TEXT,
            write_count INTEGER NOT NULL DEFAULT 1
        )"
    );
    sqlx::query(&ddl).execute(pool).await?;
    Ok(())
}

#[instrument(skip_all, fields(table = %table))]
pub async fn count_records(pool: &Pool, table: &str) -> Result<i64, LoadError> {
    validate_table_name(table)?;
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Insert-or-update a batch keyed by `entity_id`, all in one transaction.
///
/// Records without an id are skipped and counted as rejected. Repeated ids
/// collapse to the last occurrence, kept at the position of the first. A row
/// whose `write_count` comes back as 1 was created by this call.
#[instrument(skip_all, fields(table = %table, records = records.len()))]
pub async fn upsert_records(
    pool: &Pool,
    table: &str,
    records: &[ExtractedRecord],
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
    request_metadata: &Value,
) -> Result<UpsertOutcome, LoadError> {
    validate_table_name(table)?;

    let mut outcome = UpsertOutcome::default();
    let mut order: Vec<&str> = Vec::with_capacity(records.len());
    let mut latest: HashMap<&str, &ExtractedRecord> = HashMap::with_capacity(records.len());
    for record in records {
        let Some(id) = record.entity_id.as_deref() else {
            warn!(
                page = record.page_number,
                position = record.position_in_page,
                "record has no entity id, skipping"
            );
            outcome.rejected += 1;
            continue;
        };
        if latest.insert(id, record).is_none() {
            order.push(id);
        }
    }
    let keyed = records.len() - outcome.rejected as usize;
    if order.len() < keyed {
        debug!(collapsed = keyed - order.len(), "repeated ids collapsed");
    }
    if order.is_empty() {
        return Ok(outcome);
    }

    let request_payload = serde_json::to_string(request_metadata)?;
    let ingested_at = Utc::now();
    let mut rows = Vec::with_capacity(order.len());
    for id in &order {
        let record = latest[id];
        rows.push(RowValues {
            entity_id: id,
            payload: serde_json::to_string(&record.payload)?,
            page_number: i64::from(record.page_number),
            page_size: i64::from(record.page_size),
        });
    }

    let mut tx = pool.begin().await?;
    for chunk in rows.chunks(ROWS_PER_STATEMENT) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {table} (entity_id, payload, ingested_at, extract_window_start, \
             extract_window_end, page_number, page_size, request_payload) "
        ));
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.entity_id)
                .push_bind(&row.payload)
                .push_bind(ingested_at)
                .push_bind(window_start)
                .push_bind(window_end)
                .push_bind(row.page_number)
                .push_bind(row.page_size)
                .push_bind(&request_payload);
        });
        builder.push(format!(
            " ON CONFLICT(entity_id) DO UPDATE SET \
             payload = excluded.payload, \
             ingested_at = excluded.ingested_at, \
             extract_window_start = excluded.extract_window_start, \
             extract_window_end = excluded.extract_window_end, \
             page_number = excluded.page_number, \
             page_size = excluded.page_size, \
             request_payload = excluded.request_payload, \
             write_count = {table}.write_count + 1 \
             RETURNING write_count"
        ));

        // An error drops `tx` without commit, which rolls the batch back.
        let returned = builder.build().fetch_all(&mut *tx).await?;
        for row in returned {
            let write_count: i64 = row.try_get("write_count")?;
            if write_count == 1 {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }
    }
    tx.commit().await?;

    info!(
        inserted = outcome.inserted,
        updated = outcome.updated,
        rejected = outcome.rejected,
        "batch upserted"
    );
    Ok(outcome)
}

struct RowValues<'a> {
    entity_id: &'a str,
    payload: String,
    page_number: i64,
    page_size: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
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

    fn rec(id: &str, name: &str) -> ExtractedRecord {
        ExtractedRecord::new(json!({"Id": id, "Name": name}), 1, 100, 1)
    }

    #[test]
    fn table_names_are_plain_identifiers() {
        assert!(validate_table_name("qb_invoices").is_ok());
        assert!(validate_table_name("_scratch2").is_ok());
        for bad in ["", "2cool", "qb-items", "items; DROP TABLE x", "a.b"] {
            assert!(matches!(
                validate_table_name(bad),
                Err(LoadError::InvalidTable(_))
            ));
        }
    }

    #[tokio::test]
    async fn repeated_ids_keep_the_last_payload() {
        let pool = setup_pool().await;
        let records = vec![rec("1", "first"), rec("2", "other"), rec("1", "second")];
        let outcome = upsert_records(&pool, "qb_items", &records, None, None, &json!({}))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome { inserted: 2, updated: 0, rejected: 0 });

        let payload: String =
            sqlx::query_scalar("SELECT payload FROM qb_items WHERE entity_id = '1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        let payload: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(payload["Name"], "second");
    }

    #[tokio::test]
    async fn ensure_raw_table_creates_new_tables() {
        let pool = setup_pool().await;
        ensure_raw_table(&pool, "qb_vendors").await.unwrap();
        ensure_raw_table(&pool, "qb_vendors").await.unwrap();
        let outcome = upsert_records(
            &pool,
            "qb_vendors",
            &[rec("v1", "Acme")],
            None,
            None,
            &json!({"entity": "Vendor"}),
        )
        .await
        .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(count_records(&pool, "qb_vendors").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn chunks_share_one_transaction() {
        let pool = setup_pool().await;
        let records: Vec<_> = (0..1_200)
            .map(|i| rec(&format!("c{i}"), "bulk"))
            .collect();
        let outcome = upsert_records(&pool, "qb_customers", &records, None, None, &json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1_200);
        assert_eq!(count_records(&pool, "qb_customers").await.unwrap(), 1_200);
    }
}
