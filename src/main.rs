//! `beadbrokerd` — minimal demo binary wiring the coordination core
//! together. Not a CLI surface: boots the store under a data directory,
//! spawns the self-timed reaper, and runs until interrupted. Mirrors the
//! teacher's `main.rs` bootstrap order (load config, init tracing, build
//! `AppContext`, run) without the subcommands and RPC surface this crate's
//! scope excludes.

use anyhow::Result;
use beadbroker::config::CoreConfig;
use beadbroker::context::CoreContext;
use beadbroker::events::TracingSink;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = std::env::var("BEADBROKER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./beadbroker-data"));

    let config = CoreConfig::load(&data_dir);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ctx = CoreContext::boot(&data_dir, &config, Some(Arc::new(TracingSink))).await?;
    tracing::info!(data_dir = %data_dir.display(), "beadbrokerd started");

    // Self-timed reaper — a convenience for single-process deployments that
    // don't want to wire an external supervisor loop. Correctness never
    // depends on this running (spec §9 open question: configurable).
    let _reaper = ctx.scheduler.spawn_reaper(Duration::from_secs(5));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
