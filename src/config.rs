//! Configuration loader and validator for the QBO backfill tools.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const SANDBOX_API_BASE: &str = "https://sandbox-quickbooks.api.intuit.com";
const PRODUCTION_API_BASE: &str = "https://quickbooks.api.intuit.com";
const TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub qbo: Qbo,
    #[serde(default)]
    pub extract: Extract,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

/// QuickBooks Online credentials and tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Qbo {
    pub client_id: String,
    pub client_secret: String,
    pub realm_id: String,
    pub refresh_token: String,
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    pub fn api_base_url(&self) -> &'static str {
        match self {
            Environment::Sandbox => SANDBOX_API_BASE,
            Environment::Production => PRODUCTION_API_BASE,
        }
    }

    /// Intuit serves both environments from the same token endpoint.
    pub fn token_url(&self) -> &'static str {
        TOKEN_URL
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Some(Environment::Sandbox),
            "production" => Some(Environment::Production),
            _ => None,
        }
    }
}

/// Extraction and load tuning. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Extract {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: usize,
    #[serde(default = "default_rate_window")]
    pub rate_window_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_seconds: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
    #[serde(default = "default_token_timeout")]
    pub token_timeout_seconds: u64,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_seconds: u64,
    #[serde(default)]
    pub minor_version: Option<u32>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_page_size() -> u32 {
    100
}
fn default_max_requests() -> usize {
    400
}
fn default_rate_window() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    1
}
fn default_max_backoff() -> u64 {
    60
}
fn default_token_timeout() -> u64 {
    30
}
fn default_query_timeout() -> u64 {
    60
}
fn default_batch_size() -> usize {
    500
}

impl Default for Extract {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_requests_per_window: default_max_requests(),
            rate_window_seconds: default_rate_window(),
            max_attempts: default_max_attempts(),
            initial_backoff_seconds: default_initial_backoff(),
            max_backoff_seconds: default_max_backoff(),
            token_timeout_seconds: default_token_timeout(),
            query_timeout_seconds: default_query_timeout(),
            minor_version: None,
            batch_size: default_batch_size(),
        }
    }
}

impl Extract {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_seconds)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_seconds)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the file; falls back to a SQLite file in `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/qbo.db", self.app.data_dir))
    }

    /// Company-scoped API root, e.g. `https://.../v3/company/<realm>`.
    pub fn company_base_url(&self) -> String {
        format!(
            "{}/v3/company/{}",
            self.qbo.environment.api_base_url(),
            self.qbo.realm_id
        )
    }

    /// Overlay host-supplied secrets (`QBO_*` variables) on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = lookup("QBO_CLIENT_ID") {
            self.qbo.client_id = v;
        }
        if let Some(v) = lookup("QBO_CLIENT_SECRET") {
            self.qbo.client_secret = v;
        }
        if let Some(v) = lookup("QBO_REALM_ID") {
            self.qbo.realm_id = v;
        }
        if let Some(v) = lookup("QBO_REFRESH_TOKEN") {
            self.qbo.refresh_token = v;
        }
        if let Some(env) = lookup("QBO_ENVIRONMENT").and_then(|v| Environment::parse(&v)) {
            self.qbo.environment = env;
        }
    }
}

/// Load configuration from a YAML file, overlay environment secrets, and validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.qbo.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("qbo.client_id must be non-empty"));
    }
    if cfg.qbo.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("qbo.client_secret must be non-empty"));
    }
    if cfg.qbo.realm_id.trim().is_empty() {
        return Err(ConfigError::Invalid("qbo.realm_id must be non-empty"));
    }
    if cfg.qbo.refresh_token.trim().is_empty() {
        return Err(ConfigError::Invalid("qbo.refresh_token must be non-empty"));
    }

    let ex = &cfg.extract;
    if ex.page_size == 0 || ex.page_size > 1000 {
        return Err(ConfigError::Invalid("extract.page_size must be within 1..=1000"));
    }
    if ex.max_requests_per_window == 0 {
        return Err(ConfigError::Invalid("extract.max_requests_per_window must be > 0"));
    }
    if ex.rate_window_seconds == 0 {
        return Err(ConfigError::Invalid("extract.rate_window_seconds must be > 0"));
    }
    if ex.max_attempts == 0 {
        return Err(ConfigError::Invalid("extract.max_attempts must be > 0"));
    }
    if ex.max_backoff_seconds < ex.initial_backoff_seconds {
        return Err(ConfigError::Invalid(
            "extract.max_backoff_seconds must be >= extract.initial_backoff_seconds",
        ));
    }
    if ex.token_timeout_seconds == 0 || ex.query_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("extract timeouts must be > 0"));
    }
    if ex.batch_size == 0 {
        return Err(ConfigError::Invalid("extract.batch_size must be > 0"));
    }

    Ok(())
}

/// Example configuration covering every section.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

qbo:
  client_id: "YOUR_QBO_CLIENT_ID"
  client_secret: "YOUR_QBO_CLIENT_SECRET"
  realm_id: "1234567890"
  refresh_token: "YOUR_QBO_REFRESH_TOKEN"
  environment: sandbox

extract:
  page_size: 100
  max_requests_per_window: 400
  rate_window_seconds: 60
  max_attempts: 5
  initial_backoff_seconds: 1
  max_backoff_seconds: 60
  token_timeout_seconds: 30
  query_timeout_seconds: 60
  batch_size: 500
"#
}
