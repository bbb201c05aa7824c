use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use ledgr_storage::BackoffPolicy;
use ledgr_sync::{
    report_recent_markdown, scheduler, BackfillDriver, LedgerPipeline, SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ledgr")]
#[command(about = "Daily profitability ledger: sync, backfill and reports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once for a client. Without dates, the 30 days ending yesterday.
    Sync {
        #[arg(long)]
        client: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Pipeline token; defaults to LEDGR_PIPELINE_TOKEN.
        #[arg(long)]
        token: Option<String>,
    },
    /// Run the pipeline month by month over a long range.
    Backfill {
        #[arg(long)]
        client: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long, default_value_t = 3)]
        retries: usize,
        #[arg(long)]
        stop_on_failure: bool,
        #[arg(long)]
        token: Option<String>,
    },
    /// Create or update the ledger tables in DATABASE_URL.
    Migrate,
    /// Run scheduled syncs for every enabled client until interrupted.
    Schedule,
    /// Summarize the newest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LEDGR_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync {
            client,
            start,
            end,
            token,
        } => {
            let token = token.or_else(|| config.pipeline_token.clone());
            let pipeline = LedgerPipeline::from_config(config).await?;
            let summary = pipeline
                .sync(&client, start.as_deref(), end.as_deref(), token.as_deref())
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
            if !summary.ok {
                warn!(run_id = %summary.run_id, status = summary.status, "sync run failed");
                return Ok(ExitCode::FAILURE);
            }
            info!(run_id = %summary.run_id, steps = summary.steps.len(), "sync run finished");
        }
        Commands::Backfill {
            client,
            from,
            to,
            retries,
            stop_on_failure,
            token,
        } => {
            let token = token.or_else(|| config.pipeline_token.clone());
            let pipeline = LedgerPipeline::from_config(config).await?;
            let driver = BackfillDriver::new(retries)
                .with_backoff(BackoffPolicy {
                    max_retries: retries,
                    base_delay: std::time::Duration::from_secs(2),
                    max_delay: std::time::Duration::from_secs(60),
                })
                .stop_on_failure(stop_on_failure);
            let report = pipeline
                .backfill(&driver, &client, from, to, token.as_deref())
                .await?;
            for chunk in &report.chunks {
                println!(
                    "{} {} attempts={} status={}",
                    chunk.window,
                    if chunk.ok() { "ok" } else { "FAILED" },
                    chunk.attempts,
                    chunk.summary.status
                );
            }
            for skipped in &report.skipped_chunks {
                println!("{skipped} skipped");
            }
            if !report.ok() {
                warn!(failed = report.failed_chunks().count(), "backfill finished with failed chunks");
                return Ok(ExitCode::FAILURE);
            }
            info!(chunks = report.chunks.len(), "backfill finished");
        }
        Commands::Migrate => {
            ledgr_sync::migrate_from_env().await?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(LedgerPipeline::from_config(config).await?);
            scheduler::run_scheduler_until_shutdown(pipeline).await?;
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.reports_root())?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_parses_dates_and_defaults_retries() {
        let cli = Cli::try_parse_from([
            "ledgr", "backfill", "--client", "acme", "--from", "2026-01-01", "--to", "2026-03-31",
        ])
        .unwrap();
        match cli.command {
            Commands::Backfill {
                client,
                from,
                retries,
                stop_on_failure,
                ..
            } => {
                assert_eq!(client, "acme");
                assert_eq!(from, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
                assert_eq!(retries, 3);
                assert!(!stop_on_failure);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sync_requires_a_client() {
        assert!(Cli::try_parse_from(["ledgr", "sync"]).is_err());
        assert!(Cli::try_parse_from(["ledgr", "backfill", "--client", "acme", "--from", "soon", "--to", "2026-03-31"]).is_err());
    }
}
