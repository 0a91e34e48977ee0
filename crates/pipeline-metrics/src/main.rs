use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use pipeline_metrics::logging::init_logging;
use pipeline_metrics::{
    Granularity, MetricsConfig, MetricsQueryService, MetricsStorage, PipelineStatus,
    RollupStorage, SqliteMetricsStorage,
};

#[derive(Parser)]
#[command(name = "pipeline-metrics")]
#[command(about = "Query persisted pipeline metrics and rollups")]
#[command(version)]
struct Cli {
    /// SQLite database (defaults to the configured db_path)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Config file (defaults to ./pipeline-metrics.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, default_value = "false")]
    debug: bool,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Most recent pipelines
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Show usage records instead of performance records
        #[arg(long)]
        usage: bool,
        /// Only pipelines with this status (running, completed, failed, cancelled)
        #[arg(long, value_parser = parse_status)]
        status: Option<PipelineStatus>,
    },
    /// Pipelines slower than a threshold
    Slow {
        #[arg(long, default_value_t = 1_000)]
        threshold_ms: u64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Pipelines above a token threshold
    Tokens {
        #[arg(long, default_value_t = 10_000)]
        threshold: u64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Request, token and latency totals for a range (RFC 3339 bounds)
    Totals {
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },
    /// Rollup buckets for a range
    Rollups {
        #[arg(long, default_value = "hour")]
        granularity: Granularity,
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
    },
    /// Per-stage duration summary for a range
    Stages {
        #[arg(long, default_value = "hour")]
        granularity: Granularity,
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
    },
    /// Performance and usage records for one pipeline
    Detail { pipeline_id: String },
}

#[derive(Serialize)]
struct TotalsReport {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    requests: u64,
    tokens: u64,
    avg_duration_ms: Option<f64>,
}

fn parse_status(value: &str) -> Result<PipelineStatus, String> {
    PipelineStatus::from_db(&value.trim().to_ascii_lowercase())
        .ok_or_else(|| format!("unknown status: {value}"))
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = match &cli.config {
        Some(path) => MetricsConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MetricsConfig::load().context("loading configuration")?,
    };
    let Some(db_path) = cli.db.clone().or_else(|| config.db_path.clone()) else {
        bail!("no database configured: pass --db or set db_path / PIPELINE_METRICS_DB_PATH");
    };
    if !db_path.exists() {
        bail!("database {} does not exist", db_path.display());
    }

    let storage = Arc::new(SqliteMetricsStorage::new(&db_path));
    storage.init().await.context("opening metrics database")?;
    let query = MetricsQueryService::new(
        Arc::clone(&storage) as Arc<dyn MetricsStorage>,
        storage as Arc<dyn RollupStorage>,
        &config.granularities,
    );

    let pretty = cli.pretty;
    match cli.command {
        Commands::Recent {
            limit,
            usage: true,
            ..
        } => print_json(&query.recent_usage_analytics(limit).await?, pretty)?,
        Commands::Recent {
            limit,
            status: Some(status),
            ..
        } => print_json(&query.performance_metrics_by_status(status, limit).await?, pretty)?,
        Commands::Recent { limit, .. } => {
            print_json(&query.recent_performance_metrics(limit).await?, pretty)?
        }
        Commands::Slow {
            threshold_ms,
            limit,
        } => print_json(&query.slow_pipelines(threshold_ms, limit).await?, pretty)?,
        Commands::Tokens { threshold, limit } => {
            print_json(&query.high_token_usage(threshold, limit).await?, pretty)?
        }
        Commands::Totals { start, end } => {
            let report = match (start, end) {
                (Some(start), Some(end)) => {
                    let totals = query.range_totals(start, end).await?;
                    TotalsReport {
                        start: Some(start),
                        end: Some(end),
                        requests: totals.requests,
                        tokens: totals.tokens,
                        avg_duration_ms: totals.avg_duration_ms(),
                    }
                }
                (None, None) => {
                    let totals = query.lifetime_totals().await?;
                    TotalsReport {
                        start: None,
                        end: None,
                        requests: totals.requests,
                        tokens: totals.tokens,
                        avg_duration_ms: totals.avg_duration_ms(),
                    }
                }
                _ => bail!("--start and --end must be given together"),
            };
            print_json(&report, pretty)?;
        }
        Commands::Rollups {
            granularity,
            start,
            end,
        } => print_json(&query.metrics_rollups(granularity, start, end).await?, pretty)?,
        Commands::Stages {
            granularity,
            start,
            end,
        } => print_json(
            &query.stage_performance_summary(granularity, start, end).await?,
            pretty,
        )?,
        Commands::Detail { pipeline_id } => match query.pipeline_detail(&pipeline_id).await? {
            Some(detail) => print_json(&detail, pretty)?,
            None => bail!("no metrics recorded for pipeline {pipeline_id}"),
        },
    }

    Ok(())
}
