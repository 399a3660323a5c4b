use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use nightshift_core::{ScheduleState, SystemClock};
use nightshift_orchestrator::{render_systemd_unit, Orchestrator, OrchestratorConfig};
use nightshift_storage::{history_markdown, ConsistencyEngine, PgRecordStore, RunLogStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "nightshift")]
#[command(about = "Nightly scrape orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daily loop until stopped.
    Run,
    /// Run a single cycle now.
    Once,
    /// Print the next trigger instant.
    Next,
    /// Show recent runs from the ledger.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Apply schema migrations to DATABASE_URL.
    Migrate,
    /// Re-derive quality metrics for every stored listing.
    Recompute,
    /// Print a systemd unit for this binary.
    ServiceUnit {
        #[arg(long)]
        exe: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nightshift=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::from_env().context("loading configuration")?;
    config.validate().context("validating configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let mut orchestrator = Orchestrator::from_config(&config, Arc::new(SystemClock))?;
            let cycles = orchestrator.run_forever(stop_channel()).await;
            info!(cycles, "orchestrator stopped");
        }
        Commands::Once => {
            let mut orchestrator = Orchestrator::from_config(&config, Arc::new(SystemClock))?;
            let record = orchestrator.run_once(&stop_channel()).await;
            println!(
                "cycle complete: run_id={} outcome={} log={}",
                record.run_id,
                record.outcome,
                record.log_path.display()
            );
            if !record.outcome.is_success() {
                bail!(
                    "cycle ended with {}: {}",
                    record.outcome,
                    record.detail.as_deref().unwrap_or("no detail")
                );
            }
        }
        Commands::Next => {
            let trigger = config.trigger()?;
            let schedule = ScheduleState::at_startup(trigger, Utc::now());
            println!(
                "next trigger: {} ({} UTC)",
                trigger.to_local(schedule.next_trigger_at).to_rfc3339(),
                schedule.next_trigger_at.to_rfc3339()
            );
        }
        Commands::History { limit } => {
            let records = RunLogStore::new(config.log_dir.clone())
                .recent_records(limit)
                .await?;
            println!("{}", history_markdown(&records));
        }
        Commands::Migrate => {
            let store = PgRecordStore::connect(&config.database_url(), &config.quality_policy())
                .await
                .context("connecting to database")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Recompute => {
            let store = PgRecordStore::connect(&config.database_url(), &config.quality_policy())
                .await
                .context("connecting to database")?;
            let engine = ConsistencyEngine::new(
                Arc::new(store),
                config.quality_policy(),
                Arc::new(SystemClock),
            );
            let refreshed = engine.recompute_all().await?;
            println!("recomputed quality metrics for {refreshed} listings");
        }
        Commands::ServiceUnit { exe } => {
            let exe = match exe {
                Some(exe) => exe,
                None => std::env::current_exe().context("locating current executable")?,
            };
            let workdir = std::env::current_dir().context("reading working directory")?;
            print!("{}", render_systemd_unit(&config, &exe, &workdir));
        }
    }

    Ok(())
}

/// Flips to `true` on Ctrl-C or SIGTERM.
fn stop_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
