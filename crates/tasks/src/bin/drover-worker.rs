//! drover-worker — runs the spooler and queue pollers for one process.
//!
//! # Usage
//!
//! ```bash
//! # Serve until SIGINT/SIGTERM
//! drover-worker --config drover.toml run
//!
//! # Check a deployment end to end
//! drover-worker smoke-task --message hello --priority HI
//! drover-worker smoke-job --depth 3 --jobs 2 --tasks 5
//!
//! # Via environment variables
//! DROVER_PROFILE=STAGING DROVER_CONFIG=/etc/drover.toml drover-worker run
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use drover_core::Config;
use drover_queue::{DurableQueue, SqsQueue};
use drover_tasks::diagnostics::{self, SmokeJob};
use drover_tasks::{
    cache, run_worker, BotRegistry, Engine, EngineConfig, Priority, QueueTier, Registry, Shutdown,
    Spooler,
};

/// Task engine worker.
#[derive(Parser, Debug)]
#[command(name = "drover-worker", version, about)]
struct Cli {
    /// Engine config file. A missing file means defaults plus environment.
    #[arg(long, env = "DROVER_CONFIG", default_value = "drover.toml")]
    config: PathBuf,

    /// Deployment profile (env key prefix). Defaults to DROVER_PROFILE.
    #[arg(long)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the spooler and pollers until shut down.
    Run,

    /// Send one diagnostic task.
    SmokeTask {
        #[arg(long, default_value = "smoke")]
        message: String,

        #[arg(long, default_value = "HS")]
        priority: Priority,

        /// Seconds the task sleeps before finishing.
        #[arg(long, default_value_t = 0.0)]
        sleep_secs: f64,
    },

    /// Send a diagnostic job tree.
    SmokeJob {
        #[arg(long, default_value = "smoke")]
        message: String,

        #[arg(long, default_value_t = 1)]
        depth: u32,

        /// Sub-jobs per node.
        #[arg(long, default_value_t = 1)]
        jobs: u32,

        /// Tasks per leaf job.
        #[arg(long, default_value_t = 1)]
        tasks: u32,

        #[arg(long, default_value = "HS")]
        priority: Priority,

        #[arg(long, default_value = drover_tasks::DEFAULT_CACHE)]
        cache: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    drover_core::config::load_dotenv();
    let cli = Cli::parse();
    tracing::info!(?cli, "starting drover-worker");

    let deployment = match &cli.profile {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    deployment.log_summary();
    let known = Config::available_profiles();
    if !known.iter().any(|p| p == deployment.profile_label()) {
        tracing::warn!(profile = %deployment.profile_label(), ?known, "no environment keys for profile, using defaults");
    }
    tracing::debug!(config = %deployment.redacted_summary(), "deployment config");

    let config = load_engine_config(&cli.config)?.with_deployment(&deployment);
    let engine = build_engine(config, &deployment).await?;

    match cli.command {
        Command::Run => {
            let shutdown = Shutdown::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                tracing::info!("shutdown signal received");
                trigger.trigger();
            });
            run_worker(engine, &BotRegistry::new(), shutdown).await?;
        }
        Command::SmokeTask {
            message,
            priority,
            sleep_secs,
        } => {
            let sleep = Duration::try_from_secs_f64(sleep_secs).context("invalid --sleep-secs")?;
            let task = diagnostics::smoke_task(&engine, &message, priority, sleep).await?;
            tracing::info!(task = %task.label(), "smoke task sent");
        }
        Command::SmokeJob {
            message,
            depth,
            jobs,
            tasks,
            priority,
            cache,
        } => {
            let spec = SmokeJob {
                message,
                depth,
                jobs,
                tasks,
                priority,
                cache,
            };
            match diagnostics::smoke_job(&engine, &spec).await? {
                Some(job) => tracing::info!(job = %job.label(), "smoke job started"),
                None => anyhow::bail!("smoke job of {} tasks is too big", spec.total_tasks()),
            }
        }
    }

    tracing::info!("drover-worker exited cleanly");
    Ok(())
}

fn load_engine_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        EngineConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))
    } else {
        tracing::info!(path = %path.display(), "no engine config file, using defaults");
        Ok(EngineConfig::from_toml("")?)
    }
}

async fn build_engine(config: EngineConfig, deployment: &Config) -> anyhow::Result<Engine> {
    let mut registry = Registry::new();
    diagnostics::register(&mut registry)?;

    let session_cache = cache::connect(
        deployment.cache.redis_url.as_deref(),
        config.engine.distributed(),
    )
    .await
    .context("session cache unavailable")?;
    let spooler = Spooler::open(config.spool.dir(), &config.spool)?;

    let mut queues: Vec<(QueueTier, Arc<dyn DurableQueue>)> = Vec::new();
    if config.engine.distributed() {
        let prefix = config.engine.queue_prefix();
        for (tier, settings) in &config.queues {
            let target = settings.target(prefix, *tier);
            let queue = SqsQueue::connect(&deployment.aws, target)
                .await
                .with_context(|| format!("failed to connect {tier} queue"))?;
            tracing::info!(%tier, queue = %queue.name(), url = %queue.queue_url(), "queue connected");
            queues.push((*tier, Arc::new(queue)));
        }
    }

    let default_cache = config.engine.default_cache.clone();
    let mut builder = Engine::builder(config)
        .registry(registry)
        .cache(default_cache, session_cache)
        .spooler(spooler);
    for (tier, queue) in queues {
        builder = builder.queue(tier, queue);
    }
    Ok(builder.build()?)
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
