//! Adaptive Strategy Engine
//!
//! Replays JSON-lines market/sentiment observations through the engine:
//! - Restores the last-known-good model version from the store
//! - Forecasts, decides and paper-executes on every observation
//! - Retrains and runs recovery on the configured cadence
//! - Stops on end of input or Ctrl-C, closing the store

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

use adaptive_strategy_engine::engine::venue::{PaperExecution, ReplaySource};
use adaptive_strategy_engine::persistence::open_store;
use adaptive_strategy_engine::telemetry::{init_logging, init_metrics, AlertManager};
use adaptive_strategy_engine::utils::types::RawInputs;
use adaptive_strategy_engine::utils::{Clock, ManualClock, SystemClock};
use adaptive_strategy_engine::{AppConfig, Collaborators, StrategyEngine};

/// Adaptive Strategy Engine - closed-loop forecasting and decision replay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// JSON-lines observations to replay (stdin if omitted)
    #[arg(short, long)]
    replay: Option<PathBuf>,

    /// Judge staleness against wall time instead of observation time
    #[arg(long)]
    wall_clock: bool,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }

    let _log_guard = init_logging(&config.telemetry)?;
    info!("Starting Adaptive Strategy Engine v{}", env!("CARGO_PKG_VERSION"));

    if config.telemetry.enable_metrics {
        init_metrics(config.telemetry.metrics_port)?;
    }

    let manual = Arc::new(ManualClock::new(0));
    let clock: Arc<dyn Clock> = if args.wall_clock {
        Arc::new(SystemClock)
    } else {
        manual.clone()
    };

    let store = open_store(&config.storage).await?;
    let alerts = Arc::new(AlertManager::new(&config.telemetry));
    let engine = StrategyEngine::new(
        config,
        clock.clone(),
        Collaborators {
            store,
            venue: Arc::new(PaperExecution::new(clock.clone())),
            source: Arc::new(ReplaySource),
            trainer: None,
        },
    );
    let alert_task = alerts.spawn(engine.bus());

    match engine.start().await {
        Ok(Some(version)) => info!("Serving model version v{}", version),
        Ok(None) => warn!("No model version available at startup"),
        Err(e) => error!("Model restore failed: {}", e),
    }

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &args.replay {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open replay file {:?}", path))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = input.lines();

    let mut processed = 0u64;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    info!("End of input after {} observations", processed);
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let raw: RawInputs = match serde_json::from_str(&line) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Skipping malformed observation: {}", e);
                        continue;
                    }
                };
                manual.advance_to(raw.market.timestamp);

                let report = engine.step(raw).await;
                processed += 1;
                if let Some(version) = report.promoted {
                    info!("Promoted model v{} after {} observations", version, processed);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received, gracefully stopping...");
                break;
            }
        }
    }

    let health = engine.health();
    match serde_json::to_string_pretty(&health) {
        Ok(summary) => info!("Final health:\n{}", summary),
        Err(e) => warn!("Could not serialize health summary: {}", e),
    }

    if let Err(e) = engine.shutdown().await {
        error!("Error closing store: {}", e);
    }
    alert_task.abort();

    info!("Adaptive Strategy Engine stopped");
    Ok(())
}
