use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Months, Utc};
use clap::{Parser, Subcommand};
use spotcheck_core::{ReferenceType, SortOrder};
use spotcheck_engine::{SpotcheckConfig, SpotcheckRegistry, SpotcheckStream};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "spotcheck")]
#[command(about = "Reconciliation reports between reference dumps and local data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate one report for a reference type from its newest pending dump.
    Run { reference_type: ReferenceType },
    /// Run every enabled stream on its cron schedule until Ctrl-C.
    Schedule,
    /// Serve the JSON query API.
    Serve,
    /// List stored report ids, newest first.
    Reports {
        reference_type: ReferenceType,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print one stored report as JSON.
    Show {
        reference_type: ReferenceType,
        reference_time: DateTime<Utc>,
    },
}

async fn load_registry(config: &SpotcheckConfig) -> Result<Arc<SpotcheckRegistry>> {
    let streams = config.load_stream_registry().await?;
    Ok(Arc::new(SpotcheckRegistry::from_config(config, &streams).await?))
}

fn stream_for(
    registry: &SpotcheckRegistry,
    reference_type: ReferenceType,
) -> Result<Arc<dyn SpotcheckStream>> {
    registry
        .get(reference_type)
        .with_context(|| format!("stream {reference_type} is not enabled in spotcheck.yaml"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SpotcheckConfig::from_env();

    match cli.command {
        Commands::Run { reference_type } => {
            let registry = load_registry(&config).await?;
            let view = stream_for(&registry, reference_type)?
                .generate_report()
                .await?;
            println!(
                "report stored: id={} observations={} open={} ignored={} resolved={}",
                view.report_id,
                view.summary.observations,
                view.summary.open_mismatches,
                view.summary.ignored,
                view.summary.resolved
            );
        }
        Commands::Schedule => {
            let registry = load_registry(&config).await?;
            let config = SpotcheckConfig {
                scheduler_enabled: true,
                ..config
            };
            let Some(sched) = registry.maybe_build_scheduler(&config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.cron, "scheduler running, Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            for stream in registry.streams() {
                stream.cancel();
            }
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let registry = load_registry(&config).await?;
            spotcheck_web::serve(registry, config.web_port).await?;
        }
        Commands::Reports {
            reference_type,
            limit,
        } => {
            let registry = load_registry(&config).await?;
            let to = Utc::now();
            let from = to.checked_sub_months(Months::new(6)).unwrap_or(to);
            let ids = stream_for(&registry, reference_type)?
                .list_report_ids(from, to, SortOrder::Desc, Some(limit))
                .await?;
            for id in ids {
                println!("{} generated={}", id, id.generated_time.to_rfc3339());
            }
        }
        Commands::Show {
            reference_type,
            reference_time,
        } => {
            let registry = load_registry(&config).await?;
            let view = stream_for(&registry, reference_type)?
                .get_report(reference_time)
                .await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    Ok(())
}
