use anyhow::Context;

use hubflow_infra::HubflowConfig;
use hubflow_node::{Node, standard_registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HubflowConfig::from_env().context("invalid HUBFLOW_* configuration")?;
    hubflow_observability::init(config.log_format);

    let mut node = Node::build(config, standard_registry()).context("failed to start node")?;
    node.start_sweepers();
    tracing::info!(
        max_concurrency = node.config().max_concurrency,
        sweep_interval_secs = node.config().sweep_interval.as_secs(),
        "hubflow node running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    node.shutdown().await;
    Ok(())
}
