//! Hive node daemon: starts one coordinator and serves until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive_bus::{EventLog, MessageBus};
use hive_coordinator::{CoordinatorConfig, SwarmCoordinator};
use hive_protocol::AgentId;
use hive_state::{JsonStore, MemoryStore, SwarmStore};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let agent = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: hive-node <agent-id> [config.toml]"))?;
    let config_path = args
        .next()
        .map(PathBuf::from)
        .or_else(CoordinatorConfig::default_path);

    let config = match &config_path {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CoordinatorConfig::default(),
    };
    config.init_tracing();

    let store: Arc<dyn SwarmStore> = match &config.data_dir {
        Some(dir) => Arc::new(JsonStore::new(dir.clone()).context("opening data directory")?),
        None => Arc::new(MemoryStore::new()),
    };

    let bus = MessageBus::with_store(store.clone()).context("reloading persisted messages")?;
    let events = EventLog::with_store(store.clone()).context("reloading persisted events")?;
    let coordinator = SwarmCoordinator::start(
        AgentId::new(agent),
        config,
        bus,
        events,
        store,
    )
    .await
    .context("starting coordinator")?;

    info!(agent = %coordinator.local_agent(), "hive node running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    coordinator.shutdown().await;
    Ok(())
}
