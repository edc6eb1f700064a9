//! Per-hub cached entity state.
//!
//! Each hub owns one `HubCache`. A cache entry is the converged view of an
//! entity at that hub: its field snapshot plus last-writer metadata. Writes
//! for one entity happen atomically under the cache lock, and the
//! synchronizer additionally serializes them per entity, so two applies can
//! never interleave field writes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use hubflow_core::{ChangeEvent, ChangeKind, EntityKey, EventId, HubId};

use crate::error::ApplyFailure;
use crate::validator::ReferenceLookup;

/// Applied event ids remembered per entry.
const APPLIED_HISTORY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWriter {
    pub source_hub: HubId,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_id: EventId,
}

impl LastWriter {
    fn of(event: &ChangeEvent) -> Self {
        Self {
            source_hub: event.source_hub.clone(),
            actor_id: event.actor_id.clone(),
            timestamp: event.timestamp,
            event_id: event.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: EntityKey,
    pub fields: BTreeMap<String, JsonValue>,
    /// Event that last wrote each field.
    pub field_writers: BTreeMap<String, EventId>,
    pub last_writer: LastWriter,
    /// Incremented on every applied event.
    pub version: u64,
    pub deleted: bool,
    applied_events: VecDeque<EventId>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    fn empty(event: &ChangeEvent) -> Self {
        Self {
            key: event.key(),
            fields: BTreeMap::new(),
            field_writers: BTreeMap::new(),
            last_writer: LastWriter::of(event),
            version: 0,
            deleted: false,
            applied_events: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn has_applied(&self, id: EventId) -> bool {
        self.applied_events.contains(&id)
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    fn write(&mut self, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::Delete => {
                self.fields.clear();
                self.field_writers.clear();
                self.deleted = true;
            }
            ChangeKind::Create | ChangeKind::Update | ChangeKind::Bulk => {
                for (name, change) in &event.fields {
                    self.fields.insert(name.clone(), change.new.clone());
                    self.field_writers.insert(name.clone(), event.id);
                }
                self.deleted = false;
            }
        }
        self.last_writer = LastWriter::of(event);
        self.version += 1;
        self.updated_at = Utc::now();
        self.applied_events.push_back(event.id);
        if self.applied_events.len() > APPLIED_HISTORY {
            self.applied_events.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied { version: u64 },
    /// The event id was already applied to this entry; nothing changed.
    AlreadyApplied,
    /// A newer write is already present (retries only); nothing changed.
    Superseded,
}

/// One hub's entity cache.
#[derive(Debug)]
pub struct HubCache {
    hub: HubId,
    entries: RwLock<HashMap<EntityKey, CacheEntry>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl HubCache {
    pub fn new(hub: HubId) -> Self {
        Self {
            hub,
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn hub(&self) -> &HubId {
        &self.hub
    }

    /// Mark the hub (un)reachable; unreachable hubs reject every apply.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulated confirmation latency before each apply.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    pub fn entry(&self, key: &EntityKey) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the event's fields into the entity's entry.
    pub async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome, ApplyFailure> {
        self.apply_inner(event, false).await
    }

    /// Like `apply`, but leaves entries whose last write is newer untouched.
    pub async fn apply_if_newer(&self, event: &ChangeEvent) -> Result<ApplyOutcome, ApplyFailure> {
        self.apply_inner(event, true).await
    }

    async fn apply_inner(
        &self,
        event: &ChangeEvent,
        only_if_newer: bool,
    ) -> Result<ApplyOutcome, ApplyFailure> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(ApplyFailure::Unavailable {
                hub: self.hub.clone(),
            });
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(event.key())
            .or_insert_with(|| CacheEntry::empty(event));

        if entry.has_applied(event.id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if only_if_newer && entry.version > 0 && entry.last_writer.timestamp > event.timestamp {
            debug!(hub = %self.hub, event_id = %event.id, "skipping superseded write");
            return Ok(ApplyOutcome::Superseded);
        }

        entry.write(event);
        debug!(hub = %self.hub, event_id = %event.id, version = entry.version, "applied change");
        Ok(ApplyOutcome::Applied {
            version: entry.version,
        })
    }
}

/// The caches of every known hub.
#[derive(Debug, Clone, Default)]
pub struct HubCacheSet {
    caches: HashMap<HubId, Arc<HubCache>>,
}

impl HubCacheSet {
    pub fn new(hubs: impl IntoIterator<Item = HubId>) -> Self {
        Self {
            caches: hubs
                .into_iter()
                .map(|hub| (hub.clone(), Arc::new(HubCache::new(hub))))
                .collect(),
        }
    }

    /// One cache per standard hub.
    pub fn standard() -> Self {
        Self::new(HubId::standard())
    }

    pub fn insert(&mut self, cache: HubCache) {
        self.caches.insert(cache.hub().clone(), Arc::new(cache));
    }

    pub fn get(&self, hub: &HubId) -> Option<Arc<HubCache>> {
        self.caches.get(hub).cloned()
    }

    pub fn hubs(&self) -> Vec<HubId> {
        let mut hubs: Vec<HubId> = self.caches.keys().cloned().collect();
        hubs.sort();
        hubs
    }
}

impl ReferenceLookup for HubCacheSet {
    fn exists(&self, key: &EntityKey) -> bool {
        self.caches
            .values()
            .any(|cache| cache.entry(key).is_some_and(|e| !e.deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use hubflow_core::EntityType;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn lead(at: i64) -> ChangeEvent {
        ChangeEvent::update(HubId::lead_intelligence(), EntityType::Lead, "lead_42", "agent_7").at(t(at))
    }

    #[tokio::test]
    async fn apply_writes_fields_and_last_writer() {
        let cache = HubCache::new(HubId::executive());
        let event = lead(1).set("email", json!("a@example.com")).set("lead_score", json!(70));
        let outcome = cache.apply(&event).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied { version: 1 });

        let entry = cache.entry(&event.key()).unwrap();
        assert_eq!(entry.field("email"), Some(&json!("a@example.com")));
        assert_eq!(entry.last_writer.source_hub, HubId::lead_intelligence());
        assert_eq!(entry.last_writer.actor_id, "agent_7");
        assert_eq!(entry.field_writers["lead_score"], event.id);
    }

    #[tokio::test]
    async fn reapplying_same_event_is_a_no_op() {
        let cache = HubCache::new(HubId::executive());
        let event = lead(1).set("stage", json!("new"));
        cache.apply(&event).await.unwrap();
        assert_eq!(cache.apply(&event).await.unwrap(), ApplyOutcome::AlreadyApplied);
        assert_eq!(cache.entry(&event.key()).unwrap().version, 1);
    }

    #[tokio::test]
    async fn later_updates_keep_untouched_fields() {
        let cache = HubCache::new(HubId::executive());
        cache.apply(&lead(1).set("email", json!("a@example.com")).set("stage", json!("new"))).await.unwrap();
        cache.apply(&lead(2).set("stage", json!("qualified"))).await.unwrap();

        let entry = cache.entry(&lead(0).key()).unwrap();
        assert_eq!(entry.field("email"), Some(&json!("a@example.com")));
        assert_eq!(entry.field("stage"), Some(&json!("qualified")));
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn delete_clears_fields() {
        let cache = HubCache::new(HubId::executive());
        cache.apply(&lead(1).set("stage", json!("new"))).await.unwrap();
        let delete = ChangeEvent::delete(HubId::lead_intelligence(), EntityType::Lead, "lead_42", "u").at(t(2));
        cache.apply(&delete).await.unwrap();
        let entry = cache.entry(&delete.key()).unwrap();
        assert!(entry.deleted);
        assert!(entry.fields.is_empty());
    }

    #[tokio::test]
    async fn apply_if_newer_skips_stale_retries() {
        let cache = HubCache::new(HubId::executive());
        cache.apply(&lead(5).set("stage", json!("won"))).await.unwrap();
        let stale = lead(1).set("stage", json!("new"));
        assert_eq!(cache.apply_if_newer(&stale).await.unwrap(), ApplyOutcome::Superseded);
        assert_eq!(cache.entry(&stale.key()).unwrap().field("stage"), Some(&json!("won")));
    }

    #[tokio::test]
    async fn unavailable_hub_rejects_writes() {
        let cache = HubCache::new(HubId::sales_copilot());
        cache.set_available(false);
        let err = cache.apply(&lead(1).set("x", json!(1))).await.unwrap_err();
        assert_eq!(err, ApplyFailure::Unavailable { hub: HubId::sales_copilot() });
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cache_set_answers_reference_lookups() {
        let caches = HubCacheSet::standard();
        let event = lead(1).set("x", json!(1));
        assert!(!caches.exists(&event.key()));
        caches.get(&HubId::executive()).unwrap().apply(&event).await.unwrap();
        assert!(caches.exists(&event.key()));
        assert_eq!(caches.hubs().len(), 5);
    }
}
