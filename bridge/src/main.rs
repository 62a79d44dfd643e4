//! Thin node entry point: loads the config, wires an in-process environment
//! and runs the bridge until interrupted. Remote chain transports plug in
//! through `BridgeChainHandles`; the built-in `--dev` environment runs both
//! chains in memory for local development.

use anyhow::{bail, Context};
use arbor_bridge::config::BridgeNodeConfig;
use arbor_bridge::mock_client::{MockChildChain, MockRootChain};
use arbor_bridge::node::{run_bridge_node, BridgeChainHandles};
use arbor_bridge_config::Config;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "arbor-bridge", about = "Arbor bridge node")]
struct Args {
    /// Path to the node config (YAML or JSON).
    #[arg(long)]
    config: PathBuf,
    /// Run against in-memory chains that produce blocks locally.
    #[arg(long)]
    dev: bool,
    /// Block time for the in-memory child chain.
    #[arg(long, default_value = "1000")]
    dev_block_time_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = BridgeNodeConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;

    if !args.dev {
        bail!(
            "no remote chain transport is configured in this build; \
             run with --dev for the in-memory environment"
        );
    }

    let root = Arc::new(MockRootChain::new());
    let child = Arc::new(MockChildChain::new());
    let chains = BridgeChainHandles {
        root: root.clone(),
        child: child.clone(),
        validators: BTreeMap::new(),
    };

    let prometheus_registry = prometheus::Registry::new();
    let node = run_bridge_node(config, chains, &prometheus_registry).await?;
    info!("bridge node running; press ctrl-c to stop");

    // Dev block production: advance the in-memory chains on a timer.
    let block_time = Duration::from_millis(args.dev_block_time_ms.max(10));
    let producer_cancel = node.cancel.clone();
    let producer = tokio::spawn(async move {
        let mut height = 0u64;
        let mut ticker = tokio::time::interval(block_time);
        loop {
            tokio::select! {
                _ = producer_cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            height += 1;
            child.advance_to_block(height);
            root.set_latest_block(height);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.cancel.cancel();
    node.orchestrator.flush_on_shutdown().await;
    let _ = producer.await;
    for handle in node.task_handles {
        let _ = handle.await;
    }
    Ok(())
}
