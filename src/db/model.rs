//! Rows read from and written to `backfill_log`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::BackfillStatus;

#[derive(Debug, Clone, Serialize)]
pub struct BackfillLogEntry {
    pub id: i64,
    pub entity_name: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub status: BackfillStatus,
    pub records_read: i64,
    pub records_inserted: i64,
    pub records_updated: i64,
    pub pages_processed: i64,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Final figures for one run, written exactly once by `log_complete`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub records_read: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub pages_processed: u64,
    pub duration_seconds: f64,
    pub status: BackfillStatus,
    pub error_message: Option<String>,
}

impl RunCompletion {
    pub fn completed(
        records_read: u64,
        records_inserted: u64,
        records_updated: u64,
        pages_processed: u64,
        duration_seconds: f64,
    ) -> Self {
        Self {
            records_read,
            records_inserted,
            records_updated,
            pages_processed,
            duration_seconds,
            status: BackfillStatus::Completed,
            error_message: None,
        }
    }

    pub fn failed(
        records_read: u64,
        records_inserted: u64,
        records_updated: u64,
        pages_processed: u64,
        duration_seconds: f64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            records_read,
            records_inserted,
            records_updated,
            pages_processed,
            duration_seconds,
            status: BackfillStatus::Failed,
            error_message: Some(error_message.into()),
        }
    }
}
