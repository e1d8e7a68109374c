use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use flowcast_core::FeedType;
use flowcast_sync::{ExtractOptions, Pipeline, PipelineConfig, RunSummary};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flowcast")]
#[command(about = "Incremental streamflow and weather forcing extraction")]
struct Cli {
    /// Pipeline config file; defaults to ./flowcast.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the site universe and per-feed capabilities.
    Discover {
        /// Re-check every site, including ones already excluded.
        #[arg(long)]
        refresh_all: bool,
    },
    /// Pull whatever is missing for one feed, or all enabled feeds.
    Extract {
        #[arg(long)]
        feed: Option<FeedType>,
        #[command(flatten)]
        options: ExtractArgs,
    },
    /// Discovery followed by every enabled feed.
    Sync {
        #[command(flatten)]
        options: ExtractArgs,
    },
    /// Site counts, capabilities, watermarks and row counts as JSON.
    Status,
    #[command(subcommand)]
    Cache(CacheCommands),
    /// Write every staged table to parquet plus a manifest.
    Export {
        #[arg(long, default_value = "exports")]
        out: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommands {
    /// Remove every cached upstream response.
    Clear,
}

#[derive(Debug, Clone, Copy, clap::Args)]
struct ExtractArgs {
    /// Ignore cached responses and go upstream.
    #[arg(long)]
    fresh: bool,
    /// Truncate the feed table and reset watermarks first.
    #[arg(long)]
    full_refresh: bool,
}

impl From<ExtractArgs> for ExtractOptions {
    fn from(args: ExtractArgs) -> Self {
        ExtractOptions {
            fresh: args.fresh,
            full_refresh: args.full_refresh,
        }
    }
}

fn print_run(summary: &RunSummary) {
    println!(
        "{}: run_id={} status={} sites={} succeeded={} transient={} excluded={} up_to_date={} inserted={} cache_hits={}",
        summary.feed,
        summary.run_id,
        summary.status(),
        summary.sites_attempted,
        summary.sites_succeeded,
        summary.sites_transient_failed,
        summary.sites_permanently_excluded,
        summary.sites_up_to_date,
        summary.records_inserted,
        summary.cache_hits,
    );
}

fn fail_on_escalation(runs: &[RunSummary]) -> Result<()> {
    let escalations: Vec<String> = runs.iter().filter_map(RunSummary::escalation).collect();
    if escalations.is_empty() {
        Ok(())
    } else {
        bail!("escalation: {}", escalations.join("; "))
    }
}

/// Cancelled on the first ctrl-c: in-flight batches finish, nothing new starts.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight batches");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load_from(cli.config)?;
    let pipeline = Pipeline::from_config(config).await?;
    let command = cli.command.unwrap_or(Commands::Sync {
        options: ExtractArgs {
            fresh: false,
            full_refresh: false,
        },
    });

    match command {
        Commands::Discover { refresh_all } => {
            let report = pipeline.discover(Utc::now(), refresh_all).await?;
            println!(
                "discovery complete: candidates={} probes={} capable={} excluded={} unknown={} regions_failed={}",
                report.candidates, report.probes_issued, report.capable, report.excluded, report.unknown, report.regions_failed
            );
        }
        Commands::Extract { feed, options } => {
            let feeds = match feed {
                Some(feed) => vec![feed],
                None => pipeline.config().feeds.enabled_feeds(),
            };
            let cancel = shutdown_token();
            let mut runs = Vec::new();
            for feed in feeds {
                if cancel.is_cancelled() {
                    break;
                }
                let summary = pipeline.extract(feed, Utc::now(), options.into(), cancel.clone()).await?;
                print_run(&summary);
                runs.push(summary);
            }
            fail_on_escalation(&runs)?;
        }
        Commands::Sync { options } => {
            let summary = pipeline.sync(Utc::now(), options.into(), shutdown_token()).await?;
            match &summary.discovery {
                Some(report) => println!(
                    "discovery: candidates={} capable={} excluded={} unknown={}",
                    report.candidates, report.capable, report.excluded, report.unknown
                ),
                None => println!("discovery: skipped (catalog unavailable), using stored sites"),
            }
            for run in &summary.runs {
                print_run(run);
            }
            fail_on_escalation(&summary.runs)?;
        }
        Commands::Status => {
            let status = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Cache(CacheCommands::Clear) => {
            let removed = pipeline.clear_cache().await?;
            println!("cache cleared: {removed} entries removed");
        }
        Commands::Export { out } => {
            let manifest = pipeline.export(&out).await?;
            println!("export complete: manifest={}", manifest.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn extract_accepts_feed_names() {
        let cli = Cli::parse_from(["flowcast", "extract", "--feed", "streamflow_dv", "--fresh"]);
        match cli.command {
            Some(Commands::Extract { feed, options }) => {
                assert_eq!(feed, Some(FeedType::StreamflowDaily));
                assert!(options.fresh);
                assert!(!options.full_refresh);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_means_sync() {
        let cli = Cli::parse_from(["flowcast", "--config", "custom.yaml"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("custom.yaml")));
    }
}
