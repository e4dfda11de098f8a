//! Daemon entry point: wires the store, scheduler, token manager, and
//! data-plane listeners together and runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zmigrate::config::Config;
use zmigrate::migrate::Executor;
use zmigrate::store::MemoryStore;
use zmigrate::syncpoint::SyncPoints;
use zmigrate::task::scheduler::Scheduler;
use zmigrate::token::TokenManager;
use zmigrate::transport::{listener, TcpConnector};
use zmigrate::zfs::{SystemRunner, Zfs};

#[derive(Parser, Debug)]
#[command(name = "zmigrate", version, about = "ZFS snapshot replication daemon")]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long, env = "ZMIGRATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the token-gated data socket address.
    #[arg(long)]
    listen: Option<String>,

    /// Override the direct data socket address.
    #[arg(long)]
    direct_listen: Option<String>,

    /// Override the scheduler worker count.
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(direct) = args.direct_listen {
        config.direct_listen = Some(direct);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if config.workers == 0 {
        anyhow::bail!("workers must be at least 1");
    }

    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(SystemRunner);
    let zfs = Zfs::new(runner.clone());
    let tokens = TokenManager::new(store.clone());

    let executor = Executor::new(
        zfs.clone(),
        SyncPoints::new(zfs.clone()),
        Arc::new(TcpConnector {
            port: config.remote_port,
        }),
        config.chunk_size,
        Duration::from_secs(config.progress_interval_secs),
    );
    let scheduler = Scheduler::start(
        config.workers,
        store.clone(),
        Duration::from_secs(config.task_ttl_secs),
        Arc::new(executor),
    );
    let api = Arc::new(zmigrate::api::Api::new(
        scheduler,
        tokens.clone(),
        Duration::from_secs(config.token_default_ttl_secs),
    ));
    let control_listener = TcpListener::bind(&config.control_listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.control_listen))?;
    tokio::spawn(async move {
        if let Err(e) = zmigrate::api::run_control(control_listener, api).await {
            error!(error = %e, "Control listener exited");
        }
    });

    let token_listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    tokio::spawn({
        let tokens = tokens.clone();
        let runner = runner.clone();
        async move {
            if let Err(e) = listener::run_token_gated(token_listener, tokens, runner).await {
                error!(error = %e, "Token-gated listener exited");
            }
        }
    });

    if let Some(addr) = &config.direct_listen {
        let direct_listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let runner = runner.clone();
        tokio::spawn(async move {
            if let Err(e) = listener::run_direct(direct_listener, runner).await {
                error!(error = %e, "Direct listener exited");
            }
        });
    }

    info!(workers = config.workers, "zmigrate daemon started");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
