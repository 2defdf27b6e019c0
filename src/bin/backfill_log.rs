use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use qbo_backfill::config;
use qbo_backfill::db;
use qbo_backfill::model::EntityKind;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print recent backfill runs and raw table counts"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Number of runs to list, newest first
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let runs = db::recent_runs(&pool, args.limit).await?;
    if runs.is_empty() {
        println!("no backfill runs recorded");
    }
    for run in &runs {
        println!(
            "#{:<5} {:<10} {:<9} read={:<6} inserted={:<6} updated={:<6} pages={:<4} duration={} started={}",
            run.id,
            run.entity_name,
            run.status.as_str(),
            run.records_read,
            run.records_inserted,
            run.records_updated,
            run.pages_processed,
            run.duration_seconds
                .map(|d| format!("{d:.1}s"))
                .unwrap_or_else(|| "-".into()),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
        if let Some(err) = &run.error_message {
            println!("       error: {err}");
        }
    }

    println!();
    for kind in [EntityKind::Invoice, EntityKind::Customer, EntityKind::Item] {
        let count = db::count_records(&pool, kind.table_name()).await?;
        println!("{:<14} {count}", kind.table_name());
    }
    Ok(())
}
