//! Field-level change events.
//!
//! A `ChangeEvent` describes one mutation of one entity, originating at one
//! hub. The field map is a `BTreeMap` so that iteration (and therefore every
//! derived result) is deterministic.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entity::{EntityKey, EntityType};
use crate::hub::HubId;
use crate::id::EventId;
use crate::priority::Priority;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    Bulk,
}

/// Strategy used to pick one winner among competing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    HighestPriority,
    BusinessRules,
    ManualReview,
    VersionMerge,
}

/// How much validation an event must pass before it may propagate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityLevel {
    /// Type/format checks only.
    Basic,
    /// Format plus business-rule checks.
    #[default]
    Business,
    /// Format, business rules and referential integrity.
    Strict,
}

/// One field's transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(default)]
    pub old: Option<JsonValue>,
    pub new: JsonValue,
}

impl FieldChange {
    pub fn new(old: Option<JsonValue>, new: JsonValue) -> Self {
        Self { old, new }
    }
}

pub type FieldMap = BTreeMap<String, FieldChange>;

/// Delivery bookkeeping carried with an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub processed_hubs: BTreeSet<HubId>,
    pub failed_hubs: BTreeMap<HubId, String>,
    pub retry_count: u32,
}

impl ProcessingState {
    pub fn record_success(&mut self, hub: &HubId) {
        self.failed_hubs.remove(hub);
        self.processed_hubs.insert(hub.clone());
    }

    pub fn record_failure(&mut self, hub: &HubId, reason: impl Into<String>) {
        self.failed_hubs.insert(hub.clone(), reason.into());
    }
}

/// A field-level mutation of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: EventId,
    pub source_hub: HubId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: ChangeKind,
    pub fields: FieldMap,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    /// Explicit targets; empty means "compute from routing configuration".
    #[serde(default)]
    pub target_hubs: Vec<HubId>,
    /// Explicit strategy; `None` defers to routing configuration.
    #[serde(default)]
    pub strategy: Option<ConflictStrategy>,
    #[serde(default)]
    pub integrity: IntegrityLevel,
    #[serde(default)]
    pub processing: ProcessingState,
}

impl ChangeEvent {
    pub fn new(
        kind: ChangeKind,
        source_hub: HubId,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            source_hub,
            entity_type,
            entity_id: entity_id.into(),
            kind,
            fields: FieldMap::new(),
            actor_id: actor_id.into(),
            timestamp: Utc::now(),
            priority: Priority::default(),
            target_hubs: Vec::new(),
            strategy: None,
            integrity: IntegrityLevel::default(),
            processing: ProcessingState::default(),
        }
    }

    pub fn update(
        source_hub: HubId,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self::new(ChangeKind::Update, source_hub, entity_type, entity_id, actor_id)
    }

    pub fn create(
        source_hub: HubId,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self::new(ChangeKind::Create, source_hub, entity_type, entity_id, actor_id)
    }

    pub fn delete(
        source_hub: HubId,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self::new(ChangeKind::Delete, source_hub, entity_type, entity_id, actor_id)
    }

    /// Record a field transition.
    pub fn field(mut self, name: impl Into<String>, old: Option<JsonValue>, new: JsonValue) -> Self {
        self.fields.insert(name.into(), FieldChange::new(old, new));
        self
    }

    /// Record a field's new value without a known previous value.
    pub fn set(self, name: impl Into<String>, new: JsonValue) -> Self {
        self.field(name, None, new)
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_targets(mut self, targets: impl IntoIterator<Item = HubId>) -> Self {
        self.target_hubs = targets.into_iter().collect();
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_integrity(mut self, integrity: IntegrityLevel) -> Self {
        self.integrity = integrity;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    pub fn new_value(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field).map(|c| &c.new)
    }
}
