//! Paginated QBO query client.
//!
//! Every HTTP call goes through [`ExtractionClient::query`], which throttles
//! against the sliding window, attaches a bearer token, and retries transient
//! failures (429, 5xx, timeouts, connection errors, expired tokens) within a
//! fixed attempt budget.
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::TokenSource;
use crate::config::Config;
use crate::error::ExtractError;
use crate::model::ExtractedRecord;
use crate::ratelimit::SlidingWindowLimiter;
use crate::retry::RetryPolicy;

pub const QUERY_ENDPOINT: &str = "/query";
pub const DEFAULT_DATE_FIELD: &str = "MetaData.LastUpdatedTime";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Connect(String),
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Connect(msg) => write!(f, "connection error: {msg}"),
            TransportError::Other(msg) => write!(f, "request error: {msg}"),
        }
    }
}

/// The single HTTP operation the client needs: an authorized GET.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        auth_header: &str,
    ) -> Result<RawResponse, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent("qbo-backfill/0.1")
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { http })
    }

    pub fn build_request(
        &self,
        url: &str,
        query: &[(String, String)],
        auth_header: &str,
    ) -> Result<reqwest::Request, reqwest::Error> {
        self.http
            .get(url)
            .query(query)
            .header("Authorization", auth_header)
            .header("Accept", "application/json")
            .build()
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl QueryTransport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        auth_header: &str,
    ) -> Result<RawResponse, TransportError> {
        let request = self
            .build_request(url, query, auth_header)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        debug!(url = %request.url(), "sending QBO request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let status = res.status().as_u16();
        let body = res.text().await.map_err(|e| classify_reqwest_error(&e))?;
        Ok(RawResponse { status, body })
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub page_size: u32,
    pub retry: RetryPolicy,
    pub max_requests_per_window: usize,
    pub rate_window: Duration,
    pub minor_version: Option<u32>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            retry: RetryPolicy::default(),
            max_requests_per_window: 400,
            rate_window: Duration::from_secs(60),
            minor_version: None,
        }
    }
}

impl ClientSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            page_size: cfg.extract.page_size,
            retry: RetryPolicy::from_config(&cfg.extract),
            max_requests_per_window: cfg.extract.max_requests_per_window,
            rate_window: cfg.extract.rate_window(),
            minor_version: cfg.extract.minor_version,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMetrics {
    pub total_requests: u64,
    pub total_retries: u64,
}

pub struct ExtractionClient {
    base_url: String,
    auth: Arc<dyn TokenSource>,
    transport: Arc<dyn QueryTransport>,
    settings: ClientSettings,
    limiter: Mutex<SlidingWindowLimiter>,
    total_requests: AtomicU64,
    total_retries: AtomicU64,
}

impl fmt::Debug for ExtractionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionClient")
            .field("base_url", &self.base_url)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct PageCursor {
    start_position: u32,
    page_number: u32,
    fetched: u64,
}

impl ExtractionClient {
    pub fn new(
        base_url: impl Into<String>,
        auth: Arc<dyn TokenSource>,
        transport: Arc<dyn QueryTransport>,
        settings: ClientSettings,
    ) -> Self {
        let limiter =
            SlidingWindowLimiter::new(settings.max_requests_per_window, settings.rate_window);
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            transport,
            settings,
            limiter: Mutex::new(limiter),
            total_requests: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn from_config(cfg: &Config, auth: Arc<dyn TokenSource>) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(cfg.extract.query_timeout())?;
        Ok(Self::new(
            cfg.company_base_url(),
            auth,
            Arc::new(transport),
            ClientSettings::from_config(cfg),
        ))
    }

    pub fn page_size(&self) -> u32 {
        self.settings.page_size
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> ClientMetrics {
        ClientMetrics {
            total_requests: self.total_requests(),
            total_retries: self.total_retries(),
        }
    }

    /// Run one query-language statement against `/query`.
    pub async fn query(&self, statement: &str) -> Result<Value, ExtractError> {
        let mut params = vec![("query".to_string(), statement.to_string())];
        if let Some(minor) = self.settings.minor_version {
            params.push(("minorversion".to_string(), minor.to_string()));
        }
        self.execute(QUERY_ENDPOINT, &params).await
    }

    async fn execute(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Value, ExtractError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let policy = self.settings.retry;

        for attempt in 0..policy.max_attempts {
            self.limiter.lock().await.acquire().await;
            let auth_header = self.auth.auth_header().await?;

            let failure = match self.transport.get(&url, params, &auth_header).await {
                Ok(res) => {
                    self.total_requests.fetch_add(1, Ordering::Relaxed);
                    match res.status {
                        200 => {
                            return serde_json::from_str(&res.body)
                                .map_err(|e| ExtractError::Decode(e.to_string()));
                        }
                        401 => {
                            warn!(attempt, "access token rejected; refreshing");
                            self.auth.invalidate().await;
                            continue;
                        }
                        status if status == 429 || status >= 500 => format!("status {status}"),
                        status => {
                            warn!(status, endpoint, "non-retryable API error");
                            return Err(ExtractError::Api {
                                status,
                                body: res.body,
                            });
                        }
                    }
                }
                Err(err) => err.to_string(),
            };

            self.total_retries.fetch_add(1, Ordering::Relaxed);
            if attempt + 1 < policy.max_attempts {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %failure,
                    "transient failure; backing off"
                );
                tokio::time::sleep(delay).await;
            } else {
                warn!(attempt = attempt + 1, reason = %failure, "transient failure on final attempt");
            }
        }

        Err(ExtractError::RetriesExhausted {
            endpoint: endpoint.to_string(),
            attempts: policy.max_attempts,
        })
    }

    /// Lazily stream every record of `entity` whose `date_field` lies in the
    /// inclusive window. One request is issued per page as the stream is polled.
    /// Each call starts again at position 1.
    pub fn fetch_entity_paginated<'a>(
        &'a self,
        entity: &'a str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        date_field: &'a str,
    ) -> impl Stream<Item = Result<ExtractedRecord, ExtractError>> + 'a {
        let page_size = self.settings.page_size;
        info!(entity, ?start, ?end, page_size, "starting extraction");

        let first = PageCursor {
            start_position: 1,
            page_number: 1,
            fetched: 0,
        };
        stream::try_unfold(Some(first), move |cursor| async move {
            match cursor {
                Some(cursor) => self.next_page(entity, start, end, date_field, cursor).await,
                None => Ok(None),
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, ExtractError>)))
        .try_flatten()
    }

    async fn next_page(
        &self,
        entity: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        date_field: &str,
        cursor: PageCursor,
    ) -> Result<Option<(Vec<ExtractedRecord>, Option<PageCursor>)>, ExtractError> {
        let page_size = self.settings.page_size;
        let statement =
            build_entity_query(entity, start, end, date_field, cursor.start_position, page_size);
        debug!(page = cursor.page_number, %statement, "fetching page");
        let response = self.query(&statement).await?;
        let records = entity_records(response, entity)?;

        if records.is_empty() {
            info!(
                entity,
                page = cursor.page_number,
                total = cursor.fetched,
                "no more records"
            );
            return Ok(None);
        }

        let count = records.len();
        let fetched = cursor.fetched + count as u64;
        let page: Vec<ExtractedRecord> = records
            .into_iter()
            .enumerate()
            .map(|(idx, payload)| {
                ExtractedRecord::new(payload, cursor.page_number, page_size, idx as u32 + 1)
            })
            .collect();
        info!(entity, page = cursor.page_number, records = count, total = fetched, "page fetched");

        // A short page is the last one; a full page may be followed by an empty one.
        let next = if count < page_size as usize {
            info!(
                entity,
                pages = cursor.page_number,
                total = fetched,
                requests = self.total_requests(),
                retries = self.total_retries(),
                "last page reached"
            );
            None
        } else {
            Some(PageCursor {
                start_position: cursor.start_position + page_size,
                page_number: cursor.page_number + 1,
                fetched,
            })
        };
        Ok(Some((page, next)))
    }

    /// Server-side count of `entity` records in the window.
    pub async fn count_entity(
        &self,
        entity: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        date_field: &str,
    ) -> Result<u64, ExtractError> {
        let statement = format!(
            "SELECT COUNT(*) FROM {entity}{}",
            window_clause(start, end, date_field)
        );
        let response = self.query(&statement).await?;
        response
            .pointer("/QueryResponse/totalCount")
            .and_then(Value::as_u64)
            .ok_or_else(|| ExtractError::Decode("missing QueryResponse.totalCount".into()))
    }
}

/// QBO timestamps are compared as `'2024-01-01T00:00:00Z'` literals.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn window_clause(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    date_field: &str,
) -> String {
    let mut conditions = Vec::new();
    if let Some(start) = start {
        conditions.push(format!("{date_field} >= '{}'", format_timestamp(start)));
    }
    if let Some(end) = end {
        conditions.push(format!("{date_field} <= '{}'", format_timestamp(end)));
    }
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

pub fn build_entity_query(
    entity: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    date_field: &str,
    start_position: u32,
    page_size: u32,
) -> String {
    format!(
        "SELECT * FROM {entity}{} STARTPOSITION {start_position} MAXRESULTS {page_size}",
        window_clause(start, end, date_field)
    )
}

/// Pull `QueryResponse.<entity>` out of a response; absent means an empty page.
fn entity_records(mut response: Value, entity: &str) -> Result<Vec<Value>, ExtractError> {
    let pointer = format!("/QueryResponse/{entity}");
    match response.pointer_mut(&pointer).map(Value::take) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(ExtractError::Decode(format!(
            "expected array at QueryResponse.{entity}, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, s).unwrap()
    }

    #[test]
    fn query_without_window() {
        let q = build_entity_query("Customer", None, None, DEFAULT_DATE_FIELD, 1, 100);
        assert_eq!(q, "SELECT * FROM Customer STARTPOSITION 1 MAXRESULTS 100");
    }

    #[test]
    fn query_with_both_bounds() {
        let q = build_entity_query(
            "Invoice",
            Some(ts(2024, 1, 1, 0, 0, 0)),
            Some(ts(2024, 12, 31, 23, 59, 59)),
            DEFAULT_DATE_FIELD,
            201,
            100,
        );
        assert_eq!(
            q,
            "SELECT * FROM Invoice WHERE MetaData.LastUpdatedTime >= '2024-01-01T00:00:00Z' \
             AND MetaData.LastUpdatedTime <= '2024-12-31T23:59:59Z' STARTPOSITION 201 MAXRESULTS 100"
        );
    }

    #[test]
    fn query_with_single_bound() {
        let q = build_entity_query("Item", None, Some(ts(2024, 6, 1, 12, 0, 0)), "TxnDate", 1, 50);
        assert_eq!(
            q,
            "SELECT * FROM Item WHERE TxnDate <= '2024-06-01T12:00:00Z' STARTPOSITION 1 MAXRESULTS 50"
        );
    }

    #[test]
    fn entity_records_handles_missing_and_malformed() {
        let ok = json!({"QueryResponse": {"Invoice": [{"Id": "1"}, {"Id": "2"}]}});
        assert_eq!(entity_records(ok, "Invoice").unwrap().len(), 2);

        let empty = json!({"QueryResponse": {}});
        assert!(entity_records(empty, "Invoice").unwrap().is_empty());

        let bad = json!({"QueryResponse": {"Invoice": "nope"}});
        assert!(matches!(
            entity_records(bad, "Invoice"),
            Err(ExtractError::Decode(_))
        ));
    }

    #[test]
    fn build_request_sets_headers_and_query() {
        let transport = HttpTransport::new(Duration::from_secs(60)).unwrap();
        let request = transport
            .build_request(
                "https://qbo.example/v3/company/42/query",
                &[("query".into(), "SELECT * FROM Item".into())],
                "Bearer token",
            )
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/v3/company/42/query");
        assert_eq!(request.url().query(), Some("query=SELECT+*+FROM+Item"));
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers.get("Accept").and_then(|h| h.to_str().ok()).unwrap(),
            "application/json"
        );
    }
}
