//! Error taxonomy shared by the extraction and load halves of a backfill.
use thiserror::Error;

/// Token exchange failures. None of these are retried.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token exchange rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("token exchange transport failure: {0}")]
    Transport(String),
    #[error("invalid token response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("retries exhausted ({attempts}) for {endpoint}")]
    RetriesExhausted { endpoint: String, attempts: u32 },
    #[error("invalid API response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),
    #[error("failed to encode JSON column: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("backfill log entry {0} not found")]
    LogNotFound(i64),
    #[error("backfill log entry {0} already has a terminal status")]
    LogAlreadyFinished(i64),
}
