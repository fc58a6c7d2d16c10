//! Worker process lifecycle: spooler, pollers and bots under one shutdown.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bot::BotRegistry;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::poller::run_poller;
use crate::priority::QueueTier;
use crate::shutdown::Shutdown;
use crate::spooler::run_spooler;

/// How long each loop gets to finish its current unit of work.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Start the engine's background loops and the given bots, then block
/// until `shutdown` fires and the loops have wound down.
pub async fn run_worker(
    engine: Engine,
    bots: &BotRegistry,
    shutdown: Shutdown,
) -> Result<(), EngineError> {
    let mut loops: Vec<(String, JoinHandle<()>)> = Vec::new();

    if engine.spooler().is_some() {
        let handle = tokio::spawn(run_spooler(engine.clone(), shutdown.clone()));
        loops.push(("spooler".to_string(), handle));
    }

    let pollers = &engine.config().pollers;
    if engine.is_distributed() {
        for tier in QueueTier::ALL {
            let Some(queue) = engine.queue(tier) else {
                continue;
            };
            match queue.health_check().await {
                Ok(health) => info!(%tier, queue = %queue.name(), %health, "queue reachable"),
                Err(e) => warn!(%tier, queue = %queue.name(), error = %e, "queue health check failed"),
            }
        }
        for (name, settings) in pollers {
            let handle = tokio::spawn(run_poller(
                engine.clone(),
                name.clone(),
                settings.clone(),
                shutdown.clone(),
            ));
            loops.push((format!("poller {name}"), handle));
        }
    } else if !pollers.is_empty() {
        warn!(pollers = pollers.len(), "single-node mode, pollers not started");
    }

    let started = bots.start_all(&engine).await?;
    info!(loops = loops.len(), bots = bots.len(), started, "worker running");

    shutdown.cancelled().await;
    info!("worker shutting down");

    for (name, handle) in loops {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => debug!(%name, "loop stopped"),
            Ok(Err(e)) => warn!(%name, error = %e, "loop panicked"),
            Err(_) => warn!(%name, "loop did not stop in time"),
        }
    }

    info!("worker shutdown complete");
    Ok(())
}
