//! Pre-load quality checks for one extraction run.
use std::collections::HashSet;
use tracing::{info, warn};

use crate::model::ExtractedRecord;

const REPORTED_SAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingId,
    EmptyPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub entity_id: Option<String>,
    pub page_number: u32,
    pub position_in_page: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: Vec<ExtractedRecord>,
    pub rejected: Vec<Rejection>,
    /// Ids seen more than once; only the first occurrence is kept.
    pub duplicate_ids: Vec<String>,
    pub duplicates_dropped: usize,
}

impl ValidationReport {
    pub fn received(&self) -> usize {
        self.valid.len() + self.rejected.len() + self.duplicates_dropped
    }
}

/// Keep records with an id and a non-empty payload, first occurrence per id.
pub fn validate_records(records: Vec<ExtractedRecord>) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut duplicated: HashSet<String> = HashSet::new();

    for record in records {
        let Some(id) = record.entity_id.clone() else {
            report.rejected.push(Rejection {
                reason: RejectReason::MissingId,
                entity_id: None,
                page_number: record.page_number,
                position_in_page: record.position_in_page,
            });
            continue;
        };

        if !seen.insert(id.clone()) {
            report.duplicates_dropped += 1;
            if duplicated.insert(id.clone()) {
                report.duplicate_ids.push(id);
            }
            continue;
        }

        if is_empty_payload(&record.payload) {
            report.rejected.push(Rejection {
                reason: RejectReason::EmptyPayload,
                entity_id: Some(id),
                page_number: record.page_number,
                position_in_page: record.position_in_page,
            });
            continue;
        }

        report.valid.push(record);
    }

    info!(
        received = report.received(),
        valid = report.valid.len(),
        rejected = report.rejected.len(),
        duplicate_ids = report.duplicate_ids.len(),
        "validation finished"
    );
    for rejection in report.rejected.iter().take(REPORTED_SAMPLES) {
        warn!(
            reason = ?rejection.reason,
            entity_id = rejection.entity_id.as_deref().unwrap_or("N/A"),
            page = rejection.page_number,
            position = rejection.position_in_page,
            "record rejected"
        );
    }
    if report.rejected.len() > REPORTED_SAMPLES {
        warn!(more = report.rejected.len() - REPORTED_SAMPLES, "further records rejected");
    }
    if !report.duplicate_ids.is_empty() {
        warn!(ids = ?report.duplicate_ids.iter().take(10).collect::<Vec<_>>(), "duplicate ids dropped");
    }

    report
}

// Only `Id` present counts as empty too: there is nothing to load but the key.
fn is_empty_payload(payload: &serde_json::Value) -> bool {
    match payload.as_object() {
        Some(map) => map.keys().all(|k| k == "Id"),
        None => true,
    }
}
