mod cli;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use killfeed_engine::{EngineDeps, EngineEvent, ErrorBudget, EsiClient, ZkillClient, start_engine};
use killfeed_store::{Store, StoreConfig};

use crate::cli::Cli;
use crate::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let store_cfg = StoreConfig::from_env()?;
    let store = Store::connect(&store_cfg).await?;
    // A broken schema at startup is the one fatal error; everything later
    // degrades to skipped kills or re-queued jobs.
    store.ensure_schema().await?;
    let store = Arc::new(store);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    let budget = Arc::new(ErrorBudget::new());
    let summary = Arc::new(ZkillClient::new(
        http.clone(),
        cli.summary_url.clone(),
        cli.user_agent.clone(),
    ));
    let detail = Arc::new(EsiClient::new(
        http,
        cli.detail_url.clone(),
        cli.user_agent.clone(),
        budget.clone(),
    ));

    let engine = start_engine(
        cli.engine_config(),
        EngineDeps {
            summary,
            detail,
            store: store.clone(),
            roster: store,
            budget,
        },
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = cli.workers,
        tick_minutes = cli.tick_minutes,
        "killfeed started"
    );

    let mut events = engine.subscribe();
    let mut signals = shutdown::listen();

    loop {
        tokio::select! {
            sig = signals.recv() => match sig {
                Some(ShutdownSignal::Graceful) => {
                    tracing::info!(
                        "stop requested; draining in-flight jobs (ctrl-c again to exit immediately)"
                    );
                    engine.request_stop();
                }
                Some(ShutdownSignal::Immediate) => {
                    tracing::warn!("exiting immediately");
                    std::process::exit(130);
                }
                None => {}
            },
            evt = events.recv() => {
                let evt = match evt {
                    Ok(evt) => evt,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if log_event(evt) {
                    break;
                }
            }
        }
    }

    engine.wait().await
}

/// Log one engine event; returns true when the engine has stopped.
fn log_event(event: EngineEvent) -> bool {
    match event {
        EngineEvent::Started | EngineEvent::StopRequested => {}
        EngineEvent::JobStarted {
            worker_idx,
            character_id,
            mode,
        } => {
            tracing::debug!(worker_idx, character_id, mode = ?mode, "job started");
        }
        EngineEvent::JobFinished { outcome } => {
            if let Some(error) = &outcome.error {
                tracing::warn!(
                    character_id = outcome.character_id,
                    pages = outcome.pages,
                    persisted = outcome.persisted,
                    error = %error,
                    "ingestion job failed"
                );
            } else {
                tracing::info!(
                    character_id = outcome.character_id,
                    mode = ?outcome.mode,
                    pages = outcome.pages,
                    refs_seen = outcome.refs_seen,
                    persisted = outcome.persisted,
                    skipped = outcome.skipped,
                    elapsed_ms = outcome.elapsed_ms,
                    "ingestion job finished"
                );
            }
        }
        EngineEvent::Warning { message } => tracing::warn!("{message}"),
        EngineEvent::Error { message } => tracing::error!("{message}"),
        EngineEvent::Stopped => return true,
    }
    false
}
