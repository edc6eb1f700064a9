//! Target-hub computation from static routing configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use hubflow_core::{ChangeEvent, ConflictStrategy, HubId};

use crate::config::{SyncConfiguration, SyncDirection};
use crate::error::RoutingError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Sorted, deduplicated, never containing the originating hub.
    pub targets: Vec<HubId>,
    /// True when the event named its own targets.
    pub explicit: bool,
    pub strategy: ConflictStrategy,
}

#[derive(Debug, Clone)]
pub struct HubRouter {
    configs: Vec<SyncConfiguration>,
    known_hubs: BTreeSet<HubId>,
}

impl HubRouter {
    pub fn new(configs: Vec<SyncConfiguration>) -> Self {
        let known_hubs = configs
            .iter()
            .flat_map(|c| std::iter::once(c.source_hub.clone()).chain(c.target_hubs.iter().cloned()))
            .collect();
        Self { configs, known_hubs }
    }

    /// Register hubs that only appear as broadcast recipients.
    pub fn with_known_hubs(mut self, hubs: impl IntoIterator<Item = HubId>) -> Self {
        self.known_hubs.extend(hubs);
        self
    }

    pub fn configs(&self) -> &[SyncConfiguration] {
        &self.configs
    }

    pub fn known_hubs(&self) -> impl Iterator<Item = &HubId> {
        self.known_hubs.iter()
    }

    /// Hubs that must receive `event`.
    ///
    /// Explicit `target_hubs` on the event win; otherwise every configuration
    /// matching the entity type contributes according to its direction.
    pub fn route(&self, event: &ChangeEvent) -> Result<Route, RoutingError> {
        let origin = &event.source_hub;
        let explicit = !event.target_hubs.is_empty();

        let mut targets: BTreeSet<HubId> = BTreeSet::new();
        if explicit {
            targets.extend(event.target_hubs.iter().cloned());
        } else {
            for config in self.matching(event) {
                match config.direction {
                    SyncDirection::OneWay | SyncDirection::ManyToOne => {
                        if &config.source_hub == origin {
                            targets.extend(config.target_hubs.iter().cloned());
                        }
                    }
                    SyncDirection::TwoWay => {
                        if &config.source_hub == origin || config.target_hubs.contains(origin) {
                            targets.insert(config.source_hub.clone());
                            targets.extend(config.target_hubs.iter().cloned());
                        }
                    }
                    SyncDirection::Broadcast => {
                        if &config.source_hub == origin {
                            targets.extend(self.known_hubs.iter().cloned());
                        }
                    }
                }
            }
        }
        targets.remove(origin);

        if targets.is_empty() {
            return Err(RoutingError::NoTargets {
                source_hub: origin.clone(),
                entity_type: event.entity_type.clone(),
            });
        }

        Ok(Route {
            targets: targets.into_iter().collect(),
            explicit,
            strategy: self.strategy_for(event),
        })
    }

    /// Strategy for `event`: its own, else the highest-priority matching
    /// configuration's, else last-write-wins.
    pub fn strategy_for(&self, event: &ChangeEvent) -> ConflictStrategy {
        if let Some(strategy) = event.strategy {
            return strategy;
        }
        self.matching(event)
            .filter(|c| c.source_hub == event.source_hub || c.target_hubs.contains(&event.source_hub))
            .min_by_key(|c| c.priority)
            .map(|c| c.strategy)
            .unwrap_or_default()
    }

    fn matching<'a>(&'a self, event: &'a ChangeEvent) -> impl Iterator<Item = &'a SyncConfiguration> + 'a {
        self.configs.iter().filter(move |c| c.applies_to(&event.entity_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_topology;
    use hubflow_core::EntityType;

    fn hubs(names: &[&str]) -> Vec<HubId> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn one_way_routes_source_to_targets() {
        let router = HubRouter::new(vec![SyncConfiguration::new(
            HubId::lead_intelligence(),
            hubs(&["hub_a", "hub_b"]),
            [EntityType::Lead],
        )]);
        let event = ChangeEvent::update(HubId::lead_intelligence(), EntityType::Lead, "lead_1", "u");
        let route = router.route(&event).unwrap();
        assert_eq!(route.targets, hubs(&["hub_a", "hub_b"]));
        assert!(!route.explicit);

        let other = ChangeEvent::update(HubId::lead_intelligence(), EntityType::Deal, "d1", "u");
        assert!(matches!(router.route(&other), Err(RoutingError::NoTargets { .. })));
    }

    #[test]
    fn explicit_targets_override_configuration_but_never_include_origin() {
        let router = HubRouter::new(default_topology());
        let event = ChangeEvent::update(HubId::executive(), EntityType::Lead, "lead_1", "u")
            .with_targets([HubId::ops_optimization(), HubId::executive()]);
        let route = router.route(&event).unwrap();
        assert_eq!(route.targets, vec![HubId::ops_optimization()]);
        assert!(route.explicit);
    }

    #[test]
    fn two_way_routes_back_to_source() {
        let router = HubRouter::new(vec![
            SyncConfiguration::new(
                HubId::sales_copilot(),
                [HubId::lead_intelligence(), HubId::executive()],
                [EntityType::Deal],
            )
            .with_direction(SyncDirection::TwoWay),
        ]);
        let event = ChangeEvent::update(HubId::executive(), EntityType::Deal, "d1", "u");
        let route = router.route(&event).unwrap();
        assert_eq!(route.targets, vec![HubId::lead_intelligence(), HubId::sales_copilot()]);
    }

    #[test]
    fn broadcast_reaches_every_known_hub_except_origin() {
        let router = HubRouter::new(default_topology());
        let event = ChangeEvent::update(HubId::executive(), EntityType::Other("memo".into()), "m1", "u");
        let route = router.route(&event).unwrap();
        let mut expected = HubId::standard();
        expected.retain(|h| h != &HubId::executive());
        expected.sort();
        assert_eq!(route.targets, expected);
    }

    #[test]
    fn strategy_prefers_event_then_configuration() {
        let router = HubRouter::new(default_topology());
        let deal = ChangeEvent::update(HubId::sales_copilot(), EntityType::Deal, "d1", "u");
        assert_eq!(router.strategy_for(&deal), ConflictStrategy::BusinessRules);
        let pinned = deal.with_strategy(ConflictStrategy::ManualReview);
        assert_eq!(router.strategy_for(&pinned), ConflictStrategy::ManualReview);
        let unknown = ChangeEvent::update(HubId::sales_copilot(), EntityType::Agent, "a1", "u");
        assert_eq!(router.strategy_for(&unknown), ConflictStrategy::LastWriteWins);
    }
}
