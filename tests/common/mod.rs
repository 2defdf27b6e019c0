#![allow(dead_code)]

use async_trait::async_trait;
use once_cell::sync::Lazy;
use qbo_backfill::auth::TokenSource;
use qbo_backfill::client::{ClientSettings, ExtractionClient, QueryTransport, RawResponse, TransportError};
use qbo_backfill::error::AuthError;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Debug, Clone)]
pub struct Call {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub auth_header: String,
}

impl Call {
    pub fn statement(&self) -> &str {
        self.query
            .iter()
            .find(|(k, _)| k == "query")
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }
}

/// Hands out `Bearer token-<n>`, where n counts invalidations.
#[derive(Default)]
pub struct CountingToken {
    pub issued: Mutex<u32>,
    pub invalidations: Mutex<u32>,
    pub reject_with: Option<u16>,
}

impl CountingToken {
    pub fn rejecting(status: u16) -> Self {
        Self {
            reject_with: Some(status),
            ..Default::default()
        }
    }

    pub async fn issued(&self) -> u32 {
        *self.issued.lock().await
    }

    pub async fn invalidations(&self) -> u32 {
        *self.invalidations.lock().await
    }
}

#[async_trait]
impl TokenSource for CountingToken {
    async fn auth_header(&self) -> Result<String, AuthError> {
        if let Some(status) = self.reject_with {
            return Err(AuthError::Rejected {
                status,
                body: "invalid_grant".into(),
            });
        }
        *self.issued.lock().await += 1;
        Ok(format!("Bearer token-{}", *self.invalidations.lock().await))
    }

    async fn invalidate(&self) {
        *self.invalidations.lock().await += 1;
    }
}

/// Replays scripted responses in order; an exhausted script answers with an
/// empty query response.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn with_script(script: Vec<Result<RawResponse, TransportError>>) -> Self {
        Self {
            script: Mutex::new(VecDeque::from(script)),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl QueryTransport for ScriptedTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        auth_header: &str,
    ) -> Result<RawResponse, TransportError> {
        self.calls.lock().await.push(Call {
            url: url.to_string(),
            query: query.to_vec(),
            auth_header: auth_header.to_string(),
        });
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(ok(json!({"QueryResponse": {}}))))
    }
}

static PAGING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"STARTPOSITION (\d+) MAXRESULTS (\d+)").unwrap());

/// Serves `records` the way the query endpoint pages them.
pub struct PagedTransport {
    entity: String,
    records: Vec<Value>,
    calls: Mutex<Vec<Call>>,
}

impl PagedTransport {
    pub fn new(entity: &str, records: Vec<Value>) -> Self {
        Self {
            entity: entity.to_string(),
            records,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl QueryTransport for PagedTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        auth_header: &str,
    ) -> Result<RawResponse, TransportError> {
        let call = Call {
            url: url.to_string(),
            query: query.to_vec(),
            auth_header: auth_header.to_string(),
        };
        let caps = PAGING
            .captures(call.statement())
            .ok_or_else(|| TransportError::Other("unpaged statement".into()))?;
        let start: usize = caps[1].parse().unwrap();
        let max: usize = caps[2].parse().unwrap();
        self.calls.lock().await.push(call);

        let from = (start - 1).min(self.records.len());
        let to = (from + max).min(self.records.len());
        let page = &self.records[from..to];
        let mut response = serde_json::Map::new();
        if !page.is_empty() {
            response.insert(self.entity.clone(), Value::Array(page.to_vec()));
            response.insert("startPosition".into(), json!(start));
            response.insert("maxResults".into(), json!(page.len()));
        }
        Ok(ok(json!({ "QueryResponse": response })))
    }
}

pub fn ok(body: Value) -> RawResponse {
    RawResponse {
        status: 200,
        body: body.to_string(),
    }
}

pub fn status(code: u16) -> RawResponse {
    RawResponse {
        status: code,
        body: format!("{{\"Fault\":{{\"type\":\"status {code}\"}}}}"),
    }
}

pub fn invoices(count: usize) -> Vec<Value> {
    (1..=count)
        .map(|i| json!({"Id": i.to_string(), "DocNumber": format!("INV-{i:04}"), "TotalAmt": i}))
        .collect()
}

pub fn client_with(
    token: Arc<dyn TokenSource>,
    transport: Arc<dyn QueryTransport>,
    settings: ClientSettings,
) -> ExtractionClient {
    ExtractionClient::new(
        "https://qbo.test/v3/company/4620816365",
        token,
        transport,
        settings,
    )
}
