use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::AddAssign;

/// One remote record plus the page coordinates it was fetched at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub payload: Value,
    pub entity_id: Option<String>,
    pub page_number: u32,
    pub page_size: u32,
    pub position_in_page: u32,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

impl ExtractedRecord {
    pub fn new(payload: Value, page_number: u32, page_size: u32, position_in_page: u32) -> Self {
        let entity_id = entity_id_of(&payload);
        Self {
            payload,
            entity_id,
            page_number,
            page_size,
            position_in_page,
            window_start: None,
            window_end: None,
        }
    }

    /// Attach the extraction window the caller requested.
    pub fn with_window(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.window_start = start;
        self.window_end = end;
        self
    }
}

/// Natural key of a QBO payload: its `Id`, as a non-empty string or a number.
pub fn entity_id_of(payload: &Value) -> Option<String> {
    match payload.get("Id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Per-batch write classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub rejected: u64,
}

impl UpsertOutcome {
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl AddAssign for UpsertOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.rejected += rhs.rejected;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackfillStatus {
    Running,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Running => "running",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "running" => Some(BackfillStatus::Running),
            "completed" => Some(BackfillStatus::Completed),
            "failed" => Some(BackfillStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackfillStatus::Running)
    }
}

/// Entities with a pre-provisioned raw table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntityKind {
    Invoice,
    Customer,
    Item,
}

impl EntityKind {
    /// Name used in the QBO query language.
    pub fn entity_name(&self) -> &'static str {
        match self {
            EntityKind::Invoice => "Invoice",
            EntityKind::Customer => "Customer",
            EntityKind::Item => "Item",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Invoice => "qb_invoices",
            EntityKind::Customer => "qb_customers",
            EntityKind::Item => "qb_items",
        }
    }

    /// Name recorded in `backfill_log.entity_name`.
    pub fn log_name(&self) -> &'static str {
        match self {
            EntityKind::Invoice => "invoices",
            EntityKind::Customer => "customers",
            EntityKind::Item => "items",
        }
    }

    pub fn parse_kind(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "invoice" | "invoices" => Some(EntityKind::Invoice),
            "customer" | "customers" => Some(EntityKind::Customer),
            "item" | "items" => Some(EntityKind::Item),
            _ => None,
        }
    }
}
