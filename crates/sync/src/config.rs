//! Static routing configuration.
//!
//! Loaded once at startup (JSON or the built-in topology) and never mutated.

use serde::{Deserialize, Serialize};

use hubflow_core::{ConflictStrategy, EntityType, HubId, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Source -> targets.
    #[default]
    OneWay,
    /// Source <-> targets: events from any target also reach the source and
    /// the other targets.
    TwoWay,
    /// Source -> every known hub.
    Broadcast,
    /// Several sources feeding one hub; routes like `OneWay` per config.
    ManyToOne,
}

fn default_batch_size() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub source_hub: HubId,
    #[serde(default)]
    pub target_hubs: Vec<HubId>,
    /// Entity types this route carries; empty means every type.
    #[serde(default)]
    pub entity_types: Vec<EntityType>,
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub strategy: ConflictStrategy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub batch_timeout_ms: u64,
}

impl SyncConfiguration {
    pub fn new(
        source_hub: HubId,
        target_hubs: impl IntoIterator<Item = HubId>,
        entity_types: impl IntoIterator<Item = EntityType>,
    ) -> Self {
        Self {
            source_hub,
            target_hubs: target_hubs.into_iter().collect(),
            entity_types: entity_types.into_iter().collect(),
            direction: SyncDirection::OneWay,
            priority: Priority::Medium,
            strategy: ConflictStrategy::LastWriteWins,
            batch_size: default_batch_size(),
            batch_timeout_ms: 0,
        }
    }

    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_batching(mut self, batch_size: usize, batch_timeout_ms: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_timeout_ms = batch_timeout_ms;
        self
    }

    pub fn applies_to(&self, entity_type: &EntityType) -> bool {
        self.entity_types.is_empty() || self.entity_types.contains(entity_type)
    }

    /// Parse a JSON array of configurations.
    pub fn from_json(raw: &str) -> Result<Vec<SyncConfiguration>, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Routing between the five standard hubs.
pub fn default_topology() -> Vec<SyncConfiguration> {
    use EntityType::{Agent, Contact, Deal, Lead, Property};

    vec![
        SyncConfiguration::new(
            HubId::lead_intelligence(),
            [HubId::sales_copilot(), HubId::automation_studio(), HubId::executive()],
            [Lead, Contact],
        )
        .with_priority(Priority::High)
        .with_strategy(ConflictStrategy::HighestPriority),
        SyncConfiguration::new(
            HubId::sales_copilot(),
            [HubId::lead_intelligence(), HubId::executive()],
            [Deal],
        )
        .with_direction(SyncDirection::TwoWay)
        .with_priority(Priority::High)
        .with_strategy(ConflictStrategy::BusinessRules),
        SyncConfiguration::new(HubId::automation_studio(), [HubId::lead_intelligence()], [Lead, Contact])
            .with_direction(SyncDirection::ManyToOne)
            .with_batching(25, 500),
        SyncConfiguration::new(HubId::ops_optimization(), [HubId::executive()], [Agent, Property])
            .with_strategy(ConflictStrategy::VersionMerge),
        SyncConfiguration::new(HubId::executive(), Vec::new(), Vec::new())
            .with_direction(SyncDirection::Broadcast)
            .with_priority(Priority::Low)
            .with_strategy(ConflictStrategy::HighestPriority),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_json_with_defaults() {
        let raw = r#"[
            {"source_hub": "lead_intelligence", "target_hubs": ["sales_copilot"], "entity_types": ["lead"]},
            {"source_hub": "executive", "direction": "broadcast", "strategy": "highest_priority"}
        ]"#;
        let configs = SyncConfiguration::from_json(raw).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].direction, SyncDirection::OneWay);
        assert_eq!(configs[0].batch_size, 1);
        assert!(configs[0].applies_to(&EntityType::Lead));
        assert!(!configs[0].applies_to(&EntityType::Deal));
        assert!(configs[1].applies_to(&EntityType::Deal));
        assert_eq!(configs[1].strategy, ConflictStrategy::HighestPriority);
    }

    #[test]
    fn invalid_hub_name_is_rejected() {
        let raw = r#"[{"source_hub": "Not A Hub"}]"#;
        assert!(SyncConfiguration::from_json(raw).is_err());
    }

    #[test]
    fn default_topology_covers_every_standard_hub() {
        let topology = default_topology();
        for hub in HubId::standard() {
            assert!(topology.iter().any(|c| c.source_hub == hub), "{hub} has no route");
        }
    }
}
