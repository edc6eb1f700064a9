//! Deterministic conflict resolution.
//!
//! `resolve` is a pure function of (event set, strategy, resolver config):
//! input order never matters because candidates are first put into a
//! canonical order (newest timestamp, then hub rank, then event id).
//!
//! Fallback chain: `BusinessRules` -> `HighestPriority` -> `LastWriteWins`.
//! `ManualReview` returns the `HighestPriority` winner provisionally and
//! flags the resolution for review.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hubflow_core::{ChangeEvent, ChangeKind, ConflictStrategy, EntityType, EventId, FieldMap, HubId};

use crate::error::ResolveError;

/// One entry of a per-entity-type business-rule table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum BusinessRule {
    /// Events from this hub are authoritative.
    PreferSourceHub(HubId),
    /// Events of this kind win (e.g. deletes over updates).
    PreferChangeKind(ChangeKind),
    /// The event carrying the largest numeric new value for this field wins.
    PreferHighestNumeric(String),
}

impl BusinessRule {
    /// Subset of `candidates` this rule selects; empty when it does not apply.
    fn select<'a>(&self, candidates: &[&'a ChangeEvent]) -> Vec<&'a ChangeEvent> {
        match self {
            BusinessRule::PreferSourceHub(hub) => candidates
                .iter()
                .copied()
                .filter(|e| &e.source_hub == hub)
                .collect(),
            BusinessRule::PreferChangeKind(kind) => candidates
                .iter()
                .copied()
                .filter(|e| &e.kind == kind)
                .collect(),
            BusinessRule::PreferHighestNumeric(field) => {
                let valued: Vec<(&ChangeEvent, f64)> = candidates
                    .iter()
                    .filter_map(|e| e.new_value(field).and_then(|v| v.as_f64()).map(|n| (*e, n)))
                    .collect();
                let Some(max) = valued.iter().map(|(_, n)| *n).reduce(f64::max) else {
                    return Vec::new();
                };
                valued
                    .into_iter()
                    .filter(|(_, n)| *n == max)
                    .map(|(e, _)| e)
                    .collect()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub winner: ChangeEvent,
    pub requested: ConflictStrategy,
    /// Strategy that actually picked the winner after fallbacks.
    pub applied: ConflictStrategy,
    pub fallback_used: bool,
    /// Every distinct competing event id, ascending.
    pub considered: Vec<EventId>,
    pub needs_review: bool,
    /// True when the winner is a synthesized field-by-field merge.
    pub merged: bool,
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    /// Hub priority order for timestamp ties; earlier is stronger.
    hub_order: Vec<HubId>,
    rules: BTreeMap<EntityType, Vec<BusinessRule>>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(HubId::standard())
    }
}

impl ConflictResolver {
    pub fn new(hub_order: Vec<HubId>) -> Self {
        Self {
            hub_order,
            rules: BTreeMap::new(),
        }
    }

    /// Default hub order plus the standard CRM rule table.
    pub fn standard() -> Self {
        Self::default()
            .with_rules(
                EntityType::Deal,
                vec![
                    BusinessRule::PreferChangeKind(ChangeKind::Delete),
                    BusinessRule::PreferSourceHub(HubId::sales_copilot()),
                    BusinessRule::PreferHighestNumeric("value".into()),
                ],
            )
            .with_rules(
                EntityType::Lead,
                vec![
                    BusinessRule::PreferChangeKind(ChangeKind::Delete),
                    BusinessRule::PreferHighestNumeric("lead_score".into()),
                ],
            )
            .with_rules(
                EntityType::Property,
                vec![BusinessRule::PreferSourceHub(HubId::ops_optimization())],
            )
    }

    pub fn with_rules(mut self, entity_type: EntityType, rules: Vec<BusinessRule>) -> Self {
        self.rules.insert(entity_type, rules);
        self
    }

    pub fn hub_order(&self) -> &[HubId] {
        &self.hub_order
    }

    /// Pick the winning event.
    pub fn resolve(
        &self,
        events: &[ChangeEvent],
        strategy: ConflictStrategy,
    ) -> Result<ChangeEvent, ResolveError> {
        self.resolve_detailed(events, strategy).map(|r| r.winner)
    }

    pub fn resolve_detailed(
        &self,
        events: &[ChangeEvent],
        strategy: ConflictStrategy,
    ) -> Result<Resolution, ResolveError> {
        let candidates = self.canonical(events)?;
        let considered = {
            let mut ids: Vec<EventId> = candidates.iter().map(|e| e.id).collect();
            ids.sort();
            ids
        };

        let mut resolution = Resolution {
            winner: candidates[0].clone(),
            requested: strategy,
            applied: strategy,
            fallback_used: false,
            considered,
            needs_review: false,
            merged: false,
        };

        match strategy {
            ConflictStrategy::LastWriteWins => {
                resolution.winner = self.last_write_wins(&candidates).clone();
            }
            ConflictStrategy::HighestPriority => {
                resolution.winner = self.highest_priority(&candidates).clone();
            }
            ConflictStrategy::BusinessRules => {
                let rules = self.rules.get(&candidates[0].entity_type);
                let narrowed = rules
                    .into_iter()
                    .flatten()
                    .map(|rule| rule.select(&candidates))
                    .find(|subset| !subset.is_empty());
                match narrowed {
                    Some(subset) => {
                        resolution.winner = self.highest_priority(&subset).clone();
                    }
                    None => {
                        resolution.winner = self.highest_priority(&candidates).clone();
                        resolution.applied = ConflictStrategy::HighestPriority;
                        resolution.fallback_used = true;
                    }
                }
            }
            ConflictStrategy::ManualReview => {
                resolution.winner = self.highest_priority(&candidates).clone();
                resolution.applied = ConflictStrategy::HighestPriority;
                resolution.needs_review = candidates.len() > 1;
            }
            ConflictStrategy::VersionMerge => {
                if candidates.len() == 1 {
                    resolution.winner = candidates[0].clone();
                } else {
                    resolution.winner = self.version_merge(&candidates);
                    resolution.merged = true;
                }
            }
        }

        Ok(resolution)
    }

    /// Deduplicate by id and sort strongest-first under last-write-wins.
    fn canonical<'a>(&self, events: &'a [ChangeEvent]) -> Result<Vec<&'a ChangeEvent>, ResolveError> {
        let first = events.first().ok_or(ResolveError::Empty)?;
        let key = first.key();
        if events.iter().any(|e| e.entity_type != key.entity_type || e.entity_id != key.entity_id) {
            return Err(ResolveError::MixedEntities);
        }

        let mut by_id: BTreeMap<EventId, &ChangeEvent> = BTreeMap::new();
        for event in events {
            by_id
                .entry(event.id)
                .and_modify(|kept| {
                    if self.lww_cmp(event, kept) == Ordering::Greater {
                        *kept = event;
                    }
                })
                .or_insert(event);
        }

        let mut candidates: Vec<&ChangeEvent> = by_id.into_values().collect();
        candidates.sort_by(|a, b| self.lww_cmp(b, a));
        Ok(candidates)
    }

    fn hub_rank(&self, hub: &HubId) -> usize {
        self.hub_order
            .iter()
            .position(|h| h == hub)
            .unwrap_or(self.hub_order.len())
    }

    /// Total order where `Greater` means "wins under last-write-wins".
    fn lww_cmp(&self, a: &ChangeEvent, b: &ChangeEvent) -> Ordering {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| self.hub_rank(&b.source_hub).cmp(&self.hub_rank(&a.source_hub)))
            .then_with(|| b.source_hub.cmp(&a.source_hub))
            .then_with(|| a.id.cmp(&b.id))
            .then_with(|| field_digest(&a.fields).cmp(&field_digest(&b.fields)))
    }

    fn last_write_wins<'a>(&self, candidates: &[&'a ChangeEvent]) -> &'a ChangeEvent {
        candidates
            .iter()
            .copied()
            .max_by(|a, b| self.lww_cmp(a, b))
            .unwrap_or(candidates[0])
    }

    fn highest_priority<'a>(&self, candidates: &[&'a ChangeEvent]) -> &'a ChangeEvent {
        let best = candidates
            .iter()
            .map(|e| e.priority)
            .min()
            .unwrap_or_default();
        let top: Vec<&ChangeEvent> = candidates
            .iter()
            .copied()
            .filter(|e| e.priority == best)
            .collect();
        self.last_write_wins(&top)
    }

    /// For each field, the value from the newest event that touched it;
    /// same-timestamp ties go to the last-write-wins order.
    fn version_merge(&self, candidates: &[&ChangeEvent]) -> ChangeEvent {
        let mut owners: BTreeMap<&str, &ChangeEvent> = BTreeMap::new();
        for &event in candidates {
            for field in event.fields.keys() {
                owners
                    .entry(field.as_str())
                    .and_modify(|owner| {
                        if self.lww_cmp(event, owner) == Ordering::Greater {
                            *owner = event;
                        }
                    })
                    .or_insert(event);
            }
        }

        let base = self.last_write_wins(candidates);
        let mut merged = base.clone();
        merged.fields = owners
            .into_iter()
            .filter_map(|(field, owner)| {
                owner
                    .fields
                    .get(field)
                    .map(|change| (field.to_string(), change.clone()))
            })
            .collect();
        let ids: Vec<EventId> = candidates.iter().map(|e| e.id).collect();
        merged.id = EventId::derived_from(&ids);
        merged.priority = candidates
            .iter()
            .map(|e| e.priority)
            .min()
            .unwrap_or(base.priority);
        merged.target_hubs = Vec::new();
        merged.processing = Default::default();
        merged
    }
}

/// Stable content fingerprint; only consulted when two distinct events share
/// an id, which callers should never produce.
fn field_digest(fields: &FieldMap) -> String {
    serde_json::to_string(fields).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use hubflow_core::Priority;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn lead(hub: HubId, at: i64) -> ChangeEvent {
        ChangeEvent::update(hub, EntityType::Lead, "lead_42", "u").at(t(at))
    }

    #[test]
    fn last_write_wins_picks_latest_timestamp() {
        let r = ConflictResolver::default();
        let older = lead(HubId::lead_intelligence(), 1).set("stage", json!("new"));
        let newer = lead(HubId::sales_copilot(), 2).set("stage", json!("qualified"));
        let winner = r
            .resolve(&[older.clone(), newer.clone()], ConflictStrategy::LastWriteWins)
            .unwrap();
        assert_eq!(winner.id, newer.id);
        let winner = r
            .resolve(&[newer.clone(), older], ConflictStrategy::LastWriteWins)
            .unwrap();
        assert_eq!(winner.id, newer.id);
    }

    #[test]
    fn timestamp_ties_go_to_hub_order() {
        let r = ConflictResolver::default();
        let exec = lead(HubId::executive(), 5).set("x", json!(1));
        let ops = lead(HubId::ops_optimization(), 5).set("x", json!(2));
        let winner = r.resolve(&[ops, exec.clone()], ConflictStrategy::LastWriteWins).unwrap();
        assert_eq!(winner.source_hub, HubId::executive());
    }

    #[test]
    fn highest_priority_beats_newer_lower_priority() {
        let r = ConflictResolver::default();
        let critical = lead(HubId::lead_intelligence(), 1).with_priority(Priority::Critical).set("x", json!(1));
        let low = lead(HubId::executive(), 9).with_priority(Priority::Low).set("x", json!(2));
        let winner = r.resolve(&[low, critical.clone()], ConflictStrategy::HighestPriority).unwrap();
        assert_eq!(winner.id, critical.id);
    }

    #[test]
    fn business_rules_narrow_then_fall_back() {
        let r = ConflictResolver::standard();
        let deal = |hub: HubId, at: i64, value: i64| {
            ChangeEvent::update(hub, EntityType::Deal, "d1", "u").at(t(at)).set("value", json!(value))
        };
        let copilot = deal(HubId::sales_copilot(), 1, 100);
        let exec = deal(HubId::executive(), 2, 500);
        let res = r
            .resolve_detailed(&[exec, copilot.clone()], ConflictStrategy::BusinessRules)
            .unwrap();
        assert_eq!(res.winner.id, copilot.id);
        assert!(!res.fallback_used);

        // No rules for agents: HighestPriority -> LastWriteWins.
        let a1 = ChangeEvent::update(HubId::executive(), EntityType::Agent, "a1", "u").at(t(1)).set("x", json!(1));
        let a2 = ChangeEvent::update(HubId::sales_copilot(), EntityType::Agent, "a1", "u").at(t(2)).set("x", json!(2));
        let res = r.resolve_detailed(&[a1, a2.clone()], ConflictStrategy::BusinessRules).unwrap();
        assert_eq!(res.winner.id, a2.id);
        assert!(res.fallback_used);
        assert_eq!(res.applied, ConflictStrategy::HighestPriority);
    }

    #[test]
    fn highest_numeric_rule() {
        let r = ConflictResolver::standard();
        let a = lead(HubId::lead_intelligence(), 3).set("lead_score", json!(40));
        let b = lead(HubId::automation_studio(), 1).set("lead_score", json!(90));
        let winner = r.resolve(&[a, b.clone()], ConflictStrategy::BusinessRules).unwrap();
        assert_eq!(winner.id, b.id);
    }

    #[test]
    fn manual_review_flags_and_returns_provisional_winner() {
        let r = ConflictResolver::default();
        let a = lead(HubId::lead_intelligence(), 1).with_priority(Priority::High).set("x", json!(1));
        let b = lead(HubId::executive(), 2).set("x", json!(2));
        let res = r.resolve_detailed(&[a.clone(), b], ConflictStrategy::ManualReview).unwrap();
        assert!(res.needs_review);
        assert_eq!(res.winner.id, a.id);
    }

    #[test]
    fn version_merge_takes_latest_value_per_field() {
        let r = ConflictResolver::default();
        let a = lead(HubId::lead_intelligence(), 1)
            .set("email", json!("old@example.com"))
            .set("score", json!(10));
        let b = lead(HubId::sales_copilot(), 2).set("email", json!("new@example.com"));
        let c = lead(HubId::executive(), 0).set("phone", json!("555-0100-22"));
        let res = r
            .resolve_detailed(&[a.clone(), b.clone(), c.clone()], ConflictStrategy::VersionMerge)
            .unwrap();

        assert!(res.merged);
        let merged = res.winner;
        assert_eq!(merged.new_value("email"), Some(&json!("new@example.com")));
        assert_eq!(merged.new_value("score"), Some(&json!(10)));
        assert_eq!(merged.new_value("phone"), Some(&json!("555-0100-22")));
        assert_eq!(merged.id, EventId::derived_from(&[a.id, b.id, c.id]));
    }

    #[test]
    fn rejects_empty_and_mixed_inputs() {
        let r = ConflictResolver::default();
        assert_eq!(r.resolve(&[], ConflictStrategy::LastWriteWins), Err(ResolveError::Empty));
        let a = lead(HubId::executive(), 1);
        let b = ChangeEvent::update(HubId::executive(), EntityType::Lead, "other", "u");
        assert_eq!(
            r.resolve(&[a, b], ConflictStrategy::LastWriteWins),
            Err(ResolveError::MixedEntities)
        );
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        const HUBS: [&str; 5] = [
            "executive",
            "lead_intelligence",
            "sales_copilot",
            "automation_studio",
            "ops_optimization",
        ];
        const FIELDS: [&str; 4] = ["email", "stage", "lead_score", "phone"];

        fn strategy() -> impl Strategy<Value = ConflictStrategy> {
            prop_oneof![
                Just(ConflictStrategy::LastWriteWins),
                Just(ConflictStrategy::HighestPriority),
                Just(ConflictStrategy::BusinessRules),
                Just(ConflictStrategy::ManualReview),
                Just(ConflictStrategy::VersionMerge),
            ]
        }

        fn event(unique_ts: bool) -> impl Strategy<Value = ChangeEvent> {
            let ts = if unique_ts { 0i64..1_000_000 } else { 0i64..4 };
            (
                0usize..HUBS.len(),
                ts,
                0u8..4,
                proptest::collection::btree_map(0usize..FIELDS.len(), 0i64..100, 1..4),
            )
                .prop_map(|(hub, at, prio, fields)| {
                    let priority = match prio {
                        0 => Priority::Critical,
                        1 => Priority::High,
                        2 => Priority::Medium,
                        _ => Priority::Low,
                    };
                    fields.into_iter().fold(
                        ChangeEvent::update(HUBS[hub].parse().unwrap(), EntityType::Lead, "lead_42", "u")
                            .at(t(at))
                            .with_priority(priority),
                        |e, (f, v)| e.set(FIELDS[f], json!(v)),
                    )
                })
        }

        proptest! {
            #[test]
            fn resolution_ignores_input_order(
                events in proptest::collection::vec(event(false), 1..6),
                strategy in strategy(),
                rotate in 0usize..6,
            ) {
                let r = ConflictResolver::standard();
                let first = r.resolve(&events, strategy).unwrap();

                let mut shuffled = events.clone();
                shuffled.reverse();
                let k = rotate % shuffled.len();
                shuffled.rotate_left(k);
                let second = r.resolve(&shuffled, strategy).unwrap();

                prop_assert_eq!(first.id, second.id);
                prop_assert_eq!(first.fields, second.fields);
            }

            #[test]
            fn version_merge_takes_union_with_latest_values(
                events in proptest::collection::vec(event(true), 2..6),
            ) {
                let timestamps: std::collections::BTreeSet<_> = events.iter().map(|e| e.timestamp).collect();
                prop_assume!(timestamps.len() == events.len());

                let r = ConflictResolver::default();
                let merged = r.resolve(&events, ConflictStrategy::VersionMerge).unwrap();

                let union: std::collections::BTreeSet<&String> =
                    events.iter().flat_map(|e| e.fields.keys()).collect();
                let merged_fields: std::collections::BTreeSet<&String> = merged.fields.keys().collect();
                prop_assert_eq!(union, merged_fields);

                for (field, change) in &merged.fields {
                    let latest = events
                        .iter()
                        .filter(|e| e.fields.contains_key(field))
                        .max_by_key(|e| e.timestamp)
                        .unwrap();
                    prop_assert_eq!(&latest.fields[field].new, &change.new);
                }
            }
        }
    }
}
