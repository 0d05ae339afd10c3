// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Network runtime daemon (nred)
//!
//! Mirrors the configured stores, runs the configured services, flushes
//! local writes on an interval, and shuts down cleanly on SIGINT/SIGTERM.

mod services;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nre_config_fs::FsConfigStore;
use nre_runtime::Runtime;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

use crate::services::{parse_router_config, FactoryContext};
use crate::settings::Overrides;

#[derive(Parser, Debug)]
#[command(author, version, about = "Network runtime daemon")]
struct Args {
    /// Settings document (JSON). Without it the platform config store is used.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory for the config store instead of the platform default.
    #[arg(long)]
    config_dir: Option<PathBuf>,
    /// Store URL (repeatable). Replaces the configured stores; the first is the default.
    #[arg(long = "store")]
    stores: Vec<String>,
    /// Collection to load at startup (repeatable). Replaces the configured list.
    #[arg(long)]
    preload: Vec<String>,
    /// Service to run in addition to the configured ones (repeatable).
    #[arg(long = "service")]
    services: Vec<String>,
    /// Router configuration for the path service as NODE=FILE (repeatable).
    #[arg(long = "router-config", value_parser = parse_router_config)]
    router_configs: Vec<(String, PathBuf)>,
    /// Seconds between background flushes; 0 disables them.
    #[arg(long, default_value_t = 5)]
    flush_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let store = match &args.config_dir {
        Some(dir) => FsConfigStore::at(dir),
        None => FsConfigStore::new(),
    }
    .context("open config store")?;
    let overrides = Overrides {
        stores: args.stores.clone(),
        preload: args.preload.clone(),
        services: args.services.clone(),
    };
    let settings = settings::resolve(args.config.as_deref(), store, &overrides)?;

    let runtime = Runtime::start(settings).await.context("start runtime")?;
    let ctx = FactoryContext {
        router_configs: args.router_configs.clone(),
    };
    for name in runtime.settings().runtime.services.clone() {
        let service = services::build(&name, &ctx)?;
        runtime
            .add_service(service)
            .with_context(|| format!("install service `{name}`"))?;
    }
    info!(
        collections = runtime.collection_names().len(),
        services = ?runtime.services().names(),
        "nred running"
    );

    run(&runtime, args.flush_interval).await;
    runtime.shutdown().await;
    info!("nred stopped");
    Ok(())
}

/// Flush on an interval until a termination signal arrives.
#[instrument(skip(runtime))]
async fn run(runtime: &Arc<Runtime>, flush_interval: u64) {
    let signal = termination();
    tokio::pin!(signal);
    if flush_interval == 0 {
        signal.await;
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(flush_interval));
    loop {
        tokio::select! {
            () = &mut signal => return,
            _ = ticker.tick() => {
                if runtime.pending().is_empty() {
                    continue;
                }
                match runtime.flush().await {
                    Ok(report) => info!(flushed = report.flushed, batches = report.batches, "periodic flush"),
                    Err(err) => warn!(%err, "periodic flush failed"),
                }
            }
        }
    }
}

#[cfg(unix)]
async fn termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut term), Ok(mut int)) = (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
    else {
        error!("could not install signal handlers; waiting for ctrl-c");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn termination() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "could not wait for ctrl-c");
    }
}
