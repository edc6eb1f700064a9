//! Runtime wiring.
//!
//! A `Node` owns one orchestrator and one synchronizer sharing a broker. The
//! orchestrator forwards change events emitted by completed actions straight
//! into the synchronizer through the `ChangeSink` seam.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use hubflow_core::HubId;
use hubflow_events::{Broker, BrokerError, InMemoryBroker, SweeperHandle};
use hubflow_infra::{ConfigError, HubflowConfig};
use hubflow_sync::{
    ConflictResolver, DataSynchronizer, DataValidator, HubCacheSet, HubRouter, SynchronizerConfig,
};
use hubflow_workflow::{HubRegistry, OrchestratorConfig, SchedulerConfig, WorkflowOrchestrator};

use crate::handlers;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("broker setup failed: {0}")]
    Broker(#[from] BrokerError),
}

/// An acknowledging handler for each standard hub.
pub fn standard_registry() -> HubRegistry {
    HubId::standard()
        .into_iter()
        .fold(HubRegistry::new(), |registry, hub| {
            registry.with(hub.clone(), handlers::acknowledging(hub))
        })
}

/// Redis when configured (and compiled in), otherwise in-process.
pub fn build_broker(config: &HubflowConfig) -> Result<Arc<dyn Broker>, NodeError> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            info!("using redis broker");
            Ok(Arc::new(hubflow_infra::broker::RedisBroker::new(url)?))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("HUBFLOW_REDIS_URL is set but the `redis` feature is disabled; using the in-memory broker");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        None => Ok(Arc::new(InMemoryBroker::new())),
    }
}

pub struct Node {
    config: HubflowConfig,
    broker: Arc<dyn Broker>,
    orchestrator: Arc<WorkflowOrchestrator>,
    synchronizer: Arc<DataSynchronizer>,
    sweepers: Vec<SweeperHandle>,
}

impl Node {
    pub fn build(config: HubflowConfig, registry: HubRegistry) -> Result<Self, NodeError> {
        let broker = build_broker(&config)?;
        Self::with_broker(config, registry, broker)
    }

    pub fn with_broker(
        config: HubflowConfig,
        registry: HubRegistry,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, NodeError> {
        let routing = config.load_routing()?;
        let router = HubRouter::new(routing).with_known_hubs(HubId::standard());
        let caches = Arc::new(HubCacheSet::new(router.known_hubs().cloned()));

        let synchronizer = Arc::new(DataSynchronizer::new(
            DataValidator::standard(),
            ConflictResolver::standard(),
            router,
            caches,
            broker.clone(),
            SynchronizerConfig::default()
                .with_conflict_window(config.conflict_window)
                .with_apply_timeout(config.apply_timeout)
                .with_state_ttl(config.registry_ttl),
        ));

        let orchestrator = Arc::new(
            WorkflowOrchestrator::new(
                registry,
                broker.clone(),
                OrchestratorConfig::default()
                    .with_scheduler(SchedulerConfig::default().with_max_concurrency(config.max_concurrency))
                    .with_registry_ttl(config.registry_ttl),
            )
            .with_change_sink(synchronizer.clone()),
        );

        info!(
            hubs = synchronizer.caches().hubs().len(),
            routes = synchronizer.router().configs().len(),
            "node assembled"
        );

        Ok(Self {
            config,
            broker,
            orchestrator,
            synchronizer,
            sweepers: Vec::new(),
        })
    }

    pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator> {
        &self.orchestrator
    }

    pub fn synchronizer(&self) -> &Arc<DataSynchronizer> {
        &self.synchronizer
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &HubflowConfig {
        &self.config
    }

    /// Start the TTL sweepers; calling again while they run does nothing.
    pub fn start_sweepers(&mut self) {
        if !self.sweepers.is_empty() {
            return;
        }
        let interval = self.config.sweep_interval;
        self.sweepers.push(self.orchestrator.spawn_sweeper(interval));
        self.sweepers.push(self.synchronizer.spawn_sweeper(interval));
    }

    pub fn sweepers_running(&self) -> usize {
        self.sweepers.len()
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        for sweeper in self.sweepers {
            let name = sweeper.name();
            sweeper.shutdown().await;
            info!(sweeper = name, "sweeper stopped");
        }
    }
}
