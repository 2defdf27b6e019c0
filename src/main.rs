use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use qbo_backfill::auth::TokenAuthenticator;
use qbo_backfill::backfill::{self, BackfillJob};
use qbo_backfill::client::ExtractionClient;
use qbo_backfill::config;
use qbo_backfill::db;
use qbo_backfill::model::EntityKind;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Backfill one QuickBooks Online entity into the local raw tables"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Entity to extract: Invoice, Customer, Item, or any other QBO entity name
    #[arg(long)]
    entity: String,

    /// Target table; required for entities outside the built-in catalog
    #[arg(long)]
    table: Option<String>,

    /// Inclusive window start (RFC 3339)
    #[arg(long, default_value = "2024-01-01T00:00:00Z")]
    start: DateTime<Utc>,

    /// Inclusive window end (RFC 3339)
    #[arg(long, default_value = "2024-12-31T23:59:59Z")]
    end: DateTime<Utc>,

    /// Field the window filters on
    #[arg(long)]
    date_field: Option<String>,

    /// Records per load transaction (defaults to `extract.batch_size`)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Only ask the API how many records the window holds
    #[arg(long)]
    count_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.start > args.end {
        bail!("--start {} is after --end {}", args.start, args.end);
    }
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let mut job = match (EntityKind::parse_kind(&args.entity), args.table.as_deref()) {
        (Some(kind), None) => BackfillJob::for_entity(kind, Some(args.start), Some(args.end)),
        (Some(kind), Some(table)) => {
            BackfillJob::named(kind.entity_name(), table, Some(args.start), Some(args.end))
        }
        (None, Some(table)) => {
            BackfillJob::named(args.entity.clone(), table, Some(args.start), Some(args.end))
        }
        (None, None) => bail!(
            "entity {:?} has no built-in table; pass --table",
            args.entity
        ),
    };
    if let Some(field) = &args.date_field {
        job = job.with_date_field(field.clone());
    }
    job = job.with_batch_size(args.batch_size.unwrap_or(cfg.extract.batch_size));

    let auth = Arc::new(TokenAuthenticator::from_config(&cfg)?);
    let client = ExtractionClient::from_config(&cfg, auth.clone())?;

    if args.count_only {
        let count = client
            .count_entity(&job.entity, job.window_start, job.window_end, &job.date_field)
            .await?;
        println!("{} records of {} in window", count, job.entity);
        warn_on_rotation(&auth).await;
        return Ok(());
    }

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let result = backfill::run_backfill(&client, &pool, &job).await;
    warn_on_rotation(&auth).await;
    let report = result?;

    info!(log_id = report.log_id, "backfill finished");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn warn_on_rotation(auth: &TokenAuthenticator) {
    if let Some(token) = auth.rotated_refresh_token().await {
        warn!("refresh token rotated; update qbo.refresh_token or QBO_REFRESH_TOKEN before the next run");
        eprintln!("new refresh token: {token}");
    }
}
