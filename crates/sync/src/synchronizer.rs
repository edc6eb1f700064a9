//! Change propagation between hubs.
//!
//! `sync_change` runs one event through validate -> detect conflicts ->
//! resolve -> route -> apply. Stages short-circuit on failure, and every
//! outcome (including per-hub failures and broker errors) is captured in the
//! returned `SyncReport`.
//!
//! Detect, resolve and apply for one entity run under that entity's
//! sequencing lock, so the order in which events are resolved is the order
//! in which they reach each hub's cache.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use hubflow_core::{
    ChangeEvent, ConflictStrategy, EntityKey, EventId, HubId, Priority, ProcessingState, ReviewId,
    SyncId,
};
use hubflow_events::keys::{event_key, hub_sync_channel};
use hubflow_events::{
    Broker, ChangeSink, HubEnvelope, Notification, NotificationKind, SinkOutcome, SweeperHandle,
    publish_json, publish_notification, stage_json,
};

use crate::cache::{ApplyOutcome, CacheEntry, HubCacheSet};
use crate::error::{ApplyFailure, FieldError, ReviewError, RoutingError};
use crate::resolver::{ConflictResolver, Resolution};
use crate::router::HubRouter;
use crate::validator::{DataValidator, ReferenceLookup};

#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Recently seen events for the same entity inside this window compete.
    pub conflict_window: Duration,
    /// Per-hub apply confirmation timeout.
    pub apply_timeout: Duration,
    /// Applied ids, recent events, queued retries and reviews older than
    /// this are evicted by `sweep`.
    pub state_ttl: Duration,
    pub staging_ttl: Duration,
    /// Deliveries are dropped from the retry queue after this many attempts.
    pub max_retry_attempts: u32,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            conflict_window: Duration::from_secs(5),
            apply_timeout: Duration::from_secs(5),
            state_ttl: Duration::from_secs(3600),
            staging_ttl: Duration::from_secs(3600),
            max_retry_attempts: 5,
        }
    }
}

impl SynchronizerConfig {
    pub fn with_conflict_window(mut self, window: Duration) -> Self {
        self.conflict_window = window;
        self
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    pub fn with_staging_ttl(mut self, ttl: Duration) -> Self {
        self.staging_ttl = ttl;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Every target hub holds the winning event.
    Completed,
    /// Some target hubs failed; they are queued for retry.
    Partial,
    Failed,
    ValidationFailed,
    RoutingFailed,
    /// The event id was already fully applied.
    Duplicate,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Completed => "completed",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
            SyncStatus::ValidationFailed => "validation_failed",
            SyncStatus::RoutingFailed => "routing_failed",
            SyncStatus::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubSyncStatus {
    Applied,
    AlreadyApplied,
    Superseded,
    Failed,
}

impl HubSyncStatus {
    pub fn is_success(self) -> bool {
        !matches!(self, HubSyncStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubResult {
    pub hub: HubId,
    pub event_id: EventId,
    pub status: HubSyncStatus,
    /// Entry version after the apply, when something was written.
    pub version: Option<u64>,
    pub error: Option<ApplyFailure>,
    pub elapsed_ms: u64,
}

impl HubResult {
    fn from_outcome(
        hub: HubId,
        event_id: EventId,
        outcome: Result<ApplyOutcome, ApplyFailure>,
        elapsed: Duration,
    ) -> Self {
        let (status, version, error) = match outcome {
            Ok(ApplyOutcome::Applied { version }) => (HubSyncStatus::Applied, Some(version), None),
            Ok(ApplyOutcome::AlreadyApplied) => (HubSyncStatus::AlreadyApplied, None, None),
            Ok(ApplyOutcome::Superseded) => (HubSyncStatus::Superseded, None, None),
            Err(e) => (HubSyncStatus::Failed, None, Some(e)),
        };
        Self {
            hub,
            event_id,
            status,
            version,
            error,
            elapsed_ms: millis(elapsed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Every competing event id, the submitted one included.
    pub competitors: Vec<EventId>,
    pub requested: ConflictStrategy,
    pub applied: ConflictStrategy,
    pub fallback_used: bool,
    pub merged: bool,
    /// Set when the resolver itself failed and last-write-wins was forced.
    pub unresolved: bool,
    pub review_id: Option<ReviewId>,
}

impl ConflictReport {
    fn from_resolution(resolution: &Resolution) -> Self {
        Self {
            competitors: resolution.considered.clone(),
            requested: resolution.requested,
            applied: resolution.applied,
            fallback_used: resolution.fallback_used,
            merged: resolution.merged,
            unresolved: false,
            review_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub sync_id: SyncId,
    pub event_id: EventId,
    pub entity: EntityKey,
    pub status: SyncStatus,
    pub winner_event_id: Option<EventId>,
    pub targets: Vec<HubId>,
    pub hub_results: Vec<HubResult>,
    pub conflict: Option<ConflictReport>,
    pub validation_errors: Vec<FieldError>,
    pub routing_error: Option<String>,
    /// Per-hub processing state of the winning event.
    pub processing: ProcessingState,
    pub broker_errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl SyncReport {
    fn new(event: &ChangeEvent) -> Self {
        Self {
            sync_id: SyncId::new(),
            event_id: event.id,
            entity: event.key(),
            status: SyncStatus::Failed,
            winner_event_id: None,
            targets: Vec::new(),
            hub_results: Vec::new(),
            conflict: None,
            validation_errors: Vec::new(),
            routing_error: None,
            processing: ProcessingState::default(),
            broker_errors: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn hub(&self, hub: &HubId) -> Option<&HubResult> {
        self.hub_results.iter().find(|r| &r.hub == hub)
    }

    pub fn applied_hubs(&self) -> Vec<HubId> {
        self.hub_results
            .iter()
            .filter(|r| r.status.is_success())
            .map(|r| r.hub.clone())
            .collect()
    }
}

/// Competing events awaiting an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: ReviewId,
    pub entity: EntityKey,
    pub candidates: Vec<ChangeEvent>,
    /// Winner applied while the review is pending.
    pub provisional_winner: EventId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub total: u64,
    pub completed: u64,
    pub partial: u64,
    pub failed: u64,
    pub validation_failed: u64,
    pub routing_failed: u64,
    pub duplicates: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub reviews_queued: u64,
    pub retries_attempted: u64,
    pub retries_succeeded: u64,
    pub average_sync_ms: f64,
    #[serde(skip)]
    total_sync_ms: u64,
}

impl SyncMetrics {
    fn record(&mut self, report: &SyncReport) {
        self.total += 1;
        match report.status {
            SyncStatus::Completed => self.completed += 1,
            SyncStatus::Partial => self.partial += 1,
            SyncStatus::Failed => self.failed += 1,
            SyncStatus::ValidationFailed => self.validation_failed += 1,
            SyncStatus::RoutingFailed => self.routing_failed += 1,
            SyncStatus::Duplicate => self.duplicates += 1,
        }
        if let Some(conflict) = &report.conflict {
            self.conflicts_detected += 1;
            if !conflict.unresolved {
                self.conflicts_resolved += 1;
            }
            if conflict.review_id.is_some() {
                self.reviews_queued += 1;
            }
        }
        self.total_sync_ms += report.elapsed_ms;
        self.average_sync_ms = self.total_sync_ms as f64 / self.total as f64;
    }
}

/// Counts of entries removed by one `sweep`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub recent_events: usize,
    pub applied_ids: usize,
    pub queued_retries: usize,
    pub reviews: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.recent_events + self.applied_ids + self.queued_retries + self.reviews
    }
}

#[derive(Debug, Clone)]
struct RecentEvent {
    event: ChangeEvent,
    seen_at: Instant,
}

#[derive(Debug, Clone)]
struct PendingDelivery {
    event: ChangeEvent,
    attempts: u32,
    last_error: ApplyFailure,
    queued_at: Instant,
}

#[derive(Debug, Default)]
struct SyncState {
    recent: HashMap<EntityKey, Vec<RecentEvent>>,
    applied: HashMap<EventId, Instant>,
    retry_queues: HashMap<HubId, VecDeque<PendingDelivery>>,
    reviews: BTreeMap<ReviewId, (ReviewItem, Instant)>,
    metrics: SyncMetrics,
}

pub struct DataSynchronizer {
    validator: DataValidator,
    resolver: ConflictResolver,
    router: HubRouter,
    caches: Arc<HubCacheSet>,
    broker: Arc<dyn Broker>,
    config: SynchronizerConfig,
    entity_locks: Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>,
    state: Mutex<SyncState>,
}

impl std::fmt::Debug for DataSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSynchronizer")
            .field("hubs", &self.caches.hubs())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DataSynchronizer {
    pub fn new(
        validator: DataValidator,
        resolver: ConflictResolver,
        router: HubRouter,
        caches: Arc<HubCacheSet>,
        broker: Arc<dyn Broker>,
        config: SynchronizerConfig,
    ) -> Self {
        Self {
            validator,
            resolver,
            router,
            caches,
            broker,
            config,
            entity_locks: Mutex::new(HashMap::new()),
            state: Mutex::new(SyncState::default()),
        }
    }

    pub fn caches(&self) -> &Arc<HubCacheSet> {
        &self.caches
    }

    pub fn router(&self) -> &HubRouter {
        &self.router
    }

    /// Propagate one change event to every hub that must receive it.
    #[instrument(skip_all, fields(event_id = %event.id, entity = %event.key(), hub = %event.source_hub))]
    pub async fn sync_change(&self, event: ChangeEvent) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::new(&event);

        let lookup: &dyn ReferenceLookup = self.caches.as_ref();
        if let Err(failed) = self.validator.validate(&event, Some(lookup)) {
            info!(errors = failed.errors.len(), "change rejected by validation");
            report.status = SyncStatus::ValidationFailed;
            report.validation_errors = failed.errors;
            return self.finish(report, started);
        }

        let key = event.key();
        let lock = self.entity_lock(&key);
        let _sequenced = lock.lock().await;

        if self.state().applied.contains_key(&event.id) {
            debug!("event already applied");
            report.status = SyncStatus::Duplicate;
            report.winner_event_id = Some(event.id);
            return self.finish(report, started);
        }

        let competitors = self.competitors(&event);
        let winner = if competitors.is_empty() {
            event.clone()
        } else {
            let mut candidates = competitors;
            candidates.push(event.clone());
            let strategy = self.router.strategy_for(&event);
            let (resolution, unresolved) = self.resolve(&candidates, strategy, &event);
            let mut conflict = ConflictReport::from_resolution(&resolution);
            conflict.unresolved = unresolved;
            info!(
                competitors = candidates.len(),
                strategy = ?strategy,
                winner = %resolution.winner.id,
                "conflict resolved"
            );

            if resolution.needs_review {
                conflict.review_id = Some(self.queue_review(&key, &candidates, &resolution));
            }
            if candidates.iter().any(|e| e.priority == Priority::Critical) {
                self.notify_critical(&key, &candidates, &resolution, &mut report.broker_errors)
                    .await;
            }
            if let Some(review_id) = conflict.review_id {
                self.notify_review(review_id, &key, &candidates, &mut report.broker_errors)
                    .await;
            }

            report.conflict = Some(conflict);
            resolution.winner
        };
        report.winner_event_id = Some(winner.id);

        let route = match self.router.route(&winner) {
            Ok(route) => route,
            Err(e @ RoutingError::NoTargets { .. }) => {
                warn!(error = %e, "no route for change");
                report.status = SyncStatus::RoutingFailed;
                report.routing_error = Some(e.to_string());
                self.remember(&event);
                return self.finish(report, started);
            }
        };
        report.targets = route.targets.clone();

        let mut winner = winner;
        self.deliver(&mut winner, &route.targets, &mut report).await;
        report.processing = winner.processing.clone();

        self.remember(&event);
        let all_applied = report.hub_results.iter().all(|r| r.status.is_success());
        if all_applied {
            let now = Instant::now();
            let mut state = self.state();
            state.applied.insert(event.id, now);
            state.applied.insert(winner.id, now);
        }

        report.status = overall_status(&report.hub_results);
        info!(status = report.status.as_str(), targets = report.targets.len(), "sync finished");
        self.finish(report, started)
    }

    /// Re-attempt queued deliveries to `hub`.
    ///
    /// Deliveries that fail again are re-queued until `max_retry_attempts`.
    #[instrument(skip_all, fields(hub = %hub))]
    pub async fn retry_failed(&self, hub: &HubId) -> Vec<HubResult> {
        let pending: Vec<PendingDelivery> = {
            let mut state = self.state();
            state
                .retry_queues
                .get_mut(hub)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default()
        };

        let mut results = Vec::with_capacity(pending.len());
        for mut delivery in pending {
            let key = delivery.event.key();
            let lock = self.entity_lock(&key);
            let _sequenced = lock.lock().await;

            let started = Instant::now();
            let outcome = match self.caches.get(hub) {
                None => Err(ApplyFailure::UnknownHub { hub: hub.clone() }),
                Some(cache) => {
                    match tokio::time::timeout(self.config.apply_timeout, cache.apply_if_newer(&delivery.event)).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ApplyFailure::Timeout {
                            hub: hub.clone(),
                            timeout_ms: millis(self.config.apply_timeout),
                        }),
                    }
                }
            };
            delivery.attempts += 1;
            let result = HubResult::from_outcome(hub.clone(), delivery.event.id, outcome, started.elapsed());

            let mut state = self.state();
            state.metrics.retries_attempted += 1;
            match &result.error {
                None => {
                    state.metrics.retries_succeeded += 1;
                    let still_queued = state
                        .retry_queues
                        .values()
                        .any(|q| q.iter().any(|d| d.event.id == delivery.event.id));
                    if !still_queued {
                        state.applied.insert(delivery.event.id, Instant::now());
                    }
                    debug!(event_id = %delivery.event.id, "retry delivered");
                }
                Some(error) if delivery.attempts < self.config.max_retry_attempts => {
                    delivery.last_error = error.clone();
                    state
                        .retry_queues
                        .entry(hub.clone())
                        .or_default()
                        .push_back(delivery);
                }
                Some(error) => {
                    warn!(
                        event_id = %delivery.event.id,
                        attempts = delivery.attempts,
                        error = %error,
                        "dropping delivery after max retries"
                    );
                }
            }
            results.push(result);
        }
        results
    }

    /// Number of deliveries waiting for `hub`.
    pub fn queued_retries(&self, hub: &HubId) -> usize {
        self.state().retry_queues.get(hub).map_or(0, VecDeque::len)
    }

    /// Last error recorded for each delivery queued for `hub`.
    pub fn queued_errors(&self, hub: &HubId) -> Vec<(EventId, ApplyFailure)> {
        self.state()
            .retry_queues
            .get(hub)
            .map(|q| q.iter().map(|d| (d.event.id, d.last_error.clone())).collect())
            .unwrap_or_default()
    }

    pub fn pending_reviews(&self) -> Vec<ReviewItem> {
        self.state()
            .reviews
            .values()
            .map(|(item, _)| item.clone())
            .collect()
    }

    /// Apply the operator's chosen event for a queued review.
    #[instrument(skip(self))]
    pub async fn adjudicate(
        &self,
        review_id: ReviewId,
        event_id: EventId,
    ) -> Result<SyncReport, ReviewError> {
        let started = Instant::now();
        let chosen = {
            let mut state = self.state();
            let (item, _) = state
                .reviews
                .get(&review_id)
                .ok_or(ReviewError::NotFound(review_id))?;
            let chosen = item
                .candidates
                .iter()
                .find(|e| e.id == event_id)
                .cloned()
                .ok_or(ReviewError::UnknownEvent(review_id))?;
            state.reviews.remove(&review_id);
            chosen
        };

        let mut report = SyncReport::new(&chosen);
        report.winner_event_id = Some(chosen.id);

        let key = chosen.key();
        let lock = self.entity_lock(&key);
        let _sequenced = lock.lock().await;

        match self.router.route(&chosen) {
            Ok(route) => {
                report.targets = route.targets.clone();
                let mut chosen = chosen;
                self.deliver(&mut chosen, &route.targets, &mut report).await;
                report.processing = chosen.processing;
                report.status = overall_status(&report.hub_results);
            }
            Err(e) => {
                report.status = SyncStatus::RoutingFailed;
                report.routing_error = Some(e.to_string());
            }
        }
        info!(status = report.status.as_str(), "review adjudicated");
        Ok(self.finish(report, started))
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.state().metrics.clone()
    }

    pub fn cache_entry(&self, hub: &HubId, key: &EntityKey) -> Option<CacheEntry> {
        self.caches.get(hub).and_then(|cache| cache.entry(key))
    }

    /// Evict sync state older than the configured TTL.
    pub fn sweep(&self, now: Instant) -> SweepStats {
        let ttl = self.config.state_ttl;
        let expired = |at: Instant| now.saturating_duration_since(at) > ttl;
        let mut stats = SweepStats::default();

        let mut state = self.state();
        for events in state.recent.values_mut() {
            let before = events.len();
            events.retain(|r| !expired(r.seen_at));
            stats.recent_events += before - events.len();
        }
        state.recent.retain(|_, events| !events.is_empty());

        let before = state.applied.len();
        state.applied.retain(|_, at| !expired(*at));
        stats.applied_ids = before - state.applied.len();

        for queue in state.retry_queues.values_mut() {
            let before = queue.len();
            queue.retain(|d| !expired(d.queued_at));
            stats.queued_retries += before - queue.len();
        }
        state.retry_queues.retain(|_, q| !q.is_empty());

        let before = state.reviews.len();
        state.reviews.retain(|_, (_, at)| !expired(*at));
        stats.reviews = before - state.reviews.len();

        let live: Vec<EntityKey> = state.recent.keys().cloned().collect();
        drop(state);

        self.entity_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, lock| Arc::strong_count(lock) > 1 || live.contains(key));

        if stats.total() > 0 {
            debug!(?stats, "swept sync state");
        }
        stats
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let synchronizer = Arc::clone(self);
        SweeperHandle::spawn("sync-state", interval, move || {
            let synchronizer = synchronizer.clone();
            async move {
                synchronizer.sweep(Instant::now());
            }
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entity_lock(&self, key: &EntityKey) -> Arc<tokio::sync::Mutex<()>> {
        self.entity_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Recently seen events for the same entity with a different id.
    fn competitors(&self, event: &ChangeEvent) -> Vec<ChangeEvent> {
        let now = Instant::now();
        self.state()
            .recent
            .get(&event.key())
            .map(|recent| {
                recent
                    .iter()
                    .filter(|r| r.event.id != event.id)
                    .filter(|r| now.saturating_duration_since(r.seen_at) <= self.config.conflict_window)
                    .map(|r| r.event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remember(&self, event: &ChangeEvent) {
        let mut state = self.state();
        let recent = state.recent.entry(event.key()).or_default();
        if !recent.iter().any(|r| r.event.id == event.id) {
            recent.push(RecentEvent {
                event: event.clone(),
                seen_at: Instant::now(),
            });
        }
    }

    /// Resolve with the requested strategy, forcing last-write-wins if the
    /// resolver rejects the input. If that fails too, the submitted event wins.
    fn resolve(
        &self,
        candidates: &[ChangeEvent],
        strategy: ConflictStrategy,
        submitted: &ChangeEvent,
    ) -> (Resolution, bool) {
        match self.resolver.resolve_detailed(candidates, strategy) {
            Ok(resolution) => (resolution, false),
            Err(e) => {
                warn!(error = %e, ?strategy, "conflict unresolved, defaulting to last-write-wins");
                let fallback = self
                    .resolver
                    .resolve_detailed(candidates, ConflictStrategy::LastWriteWins)
                    .unwrap_or_else(|_| Resolution {
                        winner: submitted.clone(),
                        requested: strategy,
                        applied: ConflictStrategy::LastWriteWins,
                        fallback_used: true,
                        considered: candidates.iter().map(|e| e.id).collect(),
                        needs_review: false,
                        merged: false,
                    });
                (fallback, true)
            }
        }
    }

    fn queue_review(
        &self,
        key: &EntityKey,
        candidates: &[ChangeEvent],
        resolution: &Resolution,
    ) -> ReviewId {
        let item = ReviewItem {
            id: ReviewId::new(),
            entity: key.clone(),
            candidates: candidates.to_vec(),
            provisional_winner: resolution.winner.id,
            created_at: Utc::now(),
        };
        let id = item.id;
        info!(review_id = %id, "queued conflict for manual review");
        self.state().reviews.insert(id, (item, Instant::now()));
        id
    }

    async fn notify_critical(
        &self,
        key: &EntityKey,
        candidates: &[ChangeEvent],
        resolution: &Resolution,
        errors: &mut Vec<String>,
    ) {
        let notification = Notification::new(
            NotificationKind::CriticalConflict,
            resolution.winner.source_hub.clone(),
            format!("Critical conflict on {key}"),
            format!(
                "{} competing changes resolved in favour of {}",
                candidates.len(),
                resolution.winner.id
            ),
        )
        .to_hubs(involved_hubs(candidates))
        .with_priority(Priority::Critical);
        if let Err(e) = publish_notification(self.broker.as_ref(), &notification).await {
            warn!(error = %e, "failed to publish conflict notification");
            errors.push(format!("notify critical conflict: {e}"));
        }
    }

    async fn notify_review(
        &self,
        review_id: ReviewId,
        key: &EntityKey,
        candidates: &[ChangeEvent],
        errors: &mut Vec<String>,
    ) {
        let source = candidates
            .last()
            .map(|e| e.source_hub.clone())
            .unwrap_or_else(HubId::executive);
        let notification = Notification::new(
            NotificationKind::ManualReviewRequired,
            source,
            format!("Manual review required for {key}"),
            format!("review {review_id}: {} competing changes", candidates.len()),
        )
        .to_hubs(involved_hubs(candidates))
        .with_priority(Priority::High);
        if let Err(e) = publish_notification(self.broker.as_ref(), &notification).await {
            warn!(error = %e, "failed to publish review notification");
            errors.push(format!("notify manual review: {e}"));
        }
    }

    /// Apply `event` to every target in parallel, queue failures for retry,
    /// then stage and publish it.
    async fn deliver(&self, event: &mut ChangeEvent, targets: &[HubId], report: &mut SyncReport) {
        let timeout = self.config.apply_timeout;
        let handles: Vec<_> = targets
            .iter()
            .map(|hub| {
                let cache = self.caches.get(hub);
                let payload = event.clone();
                let target = hub.clone();
                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome = match cache {
                        None => Err(ApplyFailure::UnknownHub { hub: target }),
                        Some(cache) => match tokio::time::timeout(timeout, cache.apply(&payload)).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(ApplyFailure::Timeout {
                                hub: target,
                                timeout_ms: millis(timeout),
                            }),
                        },
                    };
                    (outcome, started.elapsed())
                });
                (hub.clone(), handle)
            })
            .collect();

        for (hub, handle) in handles {
            let (outcome, elapsed) = match handle.await {
                Ok(done) => done,
                Err(e) => (
                    Err(ApplyFailure::Aborted {
                        hub: hub.clone(),
                        reason: e.to_string(),
                    }),
                    Duration::ZERO,
                ),
            };
            let result = HubResult::from_outcome(hub.clone(), event.id, outcome, elapsed);
            match &result.error {
                None => event.processing.record_success(&hub),
                Some(error) => {
                    warn!(hub = %hub, error = %error, "apply failed, queued for retry");
                    event.processing.record_failure(&hub, error.to_string());
                    self.state()
                        .retry_queues
                        .entry(hub.clone())
                        .or_default()
                        .push_back(PendingDelivery {
                            event: event.clone(),
                            attempts: 1,
                            last_error: error.clone(),
                            queued_at: Instant::now(),
                        });
                }
            }
            report.hub_results.push(result);
        }

        let key = event_key(event.id);
        if let Err(e) = stage_json(self.broker.as_ref(), &key, &*event, self.config.staging_ttl).await {
            warn!(error = %e, "failed to stage change event");
            report.broker_errors.push(format!("stage {key}: {e}"));
        }

        for result in &report.hub_results {
            if result.status != HubSyncStatus::Applied {
                continue;
            }
            let envelope = HubEnvelope::new(event.source_hub.clone(), result.hub.clone(), &*event);
            let channel = hub_sync_channel(&result.hub);
            if let Err(e) = publish_json(self.broker.as_ref(), &channel, &envelope).await {
                warn!(hub = %result.hub, error = %e, "failed to publish sync payload");
                report.broker_errors.push(format!("publish {channel}: {e}"));
            }
        }
    }

    fn finish(&self, mut report: SyncReport, started: Instant) -> SyncReport {
        report.elapsed_ms = millis(started.elapsed());
        self.state().metrics.record(&report);
        report
    }
}

#[async_trait]
impl ChangeSink for DataSynchronizer {
    async fn submit(&self, event: ChangeEvent) -> SinkOutcome {
        let report = self.sync_change(event).await;
        let outcome = SinkOutcome::new(report.event_id, report.status.as_str());
        match (&report.routing_error, report.validation_errors.first()) {
            (Some(reason), _) => outcome.with_detail(reason.clone()),
            (None, Some(first)) => outcome.with_detail(format!("{}: {}", first.field, first.message)),
            (None, None) => outcome,
        }
    }
}

fn overall_status(results: &[HubResult]) -> SyncStatus {
    let ok = results.iter().filter(|r| r.status.is_success()).count();
    if ok == results.len() {
        SyncStatus::Completed
    } else if ok > 0 {
        SyncStatus::Partial
    } else {
        SyncStatus::Failed
    }
}

fn involved_hubs(candidates: &[ChangeEvent]) -> Vec<HubId> {
    let mut hubs: Vec<HubId> = candidates.iter().map(|e| e.source_hub.clone()).collect();
    hubs.sort();
    hubs.dedup();
    hubs
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncConfiguration, default_topology};
    use chrono::TimeZone;
    use hubflow_core::EntityType;
    use hubflow_events::InMemoryBroker;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    struct Fixture {
        sync: DataSynchronizer,
        broker: Arc<InMemoryBroker>,
        caches: Arc<HubCacheSet>,
    }

    fn fixture_with(configs: Vec<SyncConfiguration>, config: SynchronizerConfig) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let caches = Arc::new(HubCacheSet::standard());
        let sync = DataSynchronizer::new(
            DataValidator::standard(),
            ConflictResolver::standard(),
            HubRouter::new(configs).with_known_hubs(HubId::standard()),
            caches.clone(),
            broker.clone(),
            config,
        );
        Fixture { sync, broker, caches }
    }

    fn fixture() -> Fixture {
        fixture_with(default_topology(), SynchronizerConfig::default())
    }

    fn lead_change(at: i64) -> ChangeEvent {
        ChangeEvent::update(HubId::lead_intelligence(), EntityType::Lead, "lead_42", "agent_7").at(t(at))
    }

    fn lead_targets() -> Vec<HubId> {
        let mut hubs = vec![HubId::sales_copilot(), HubId::automation_studio(), HubId::executive()];
        hubs.sort();
        hubs
    }

    #[tokio::test]
    async fn completed_sync_converges_every_target() {
        let f = fixture();
        let event = lead_change(1).set("email", json!("jane@example.com")).set("lead_score", json!(81));
        let report = f.sync.sync_change(event.clone()).await;

        assert_eq!(report.status, SyncStatus::Completed);
        assert_eq!(report.targets, lead_targets());
        for hub in lead_targets() {
            let entry = f.sync.cache_entry(&hub, &event.key()).unwrap();
            assert_eq!(entry.field("email"), Some(&json!("jane@example.com")));
            assert_eq!(entry.field("lead_score"), Some(&json!(81)));
        }
        assert!(f.sync.cache_entry(&HubId::lead_intelligence(), &event.key()).is_none());
        assert_eq!(report.processing.processed_hubs.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_changes_to_one_entity_leave_targets_consistent() {
        let f = fixture();
        for hub in lead_targets() {
            f.caches
                .get(&hub)
                .unwrap()
                .set_latency(Duration::from_millis(5));
        }
        let first = lead_change(1).set("stage", json!("contacted")).set("lead_score", json!(55));
        let second = lead_change(2).set("stage", json!("qualified")).set("budget", json!(450000));
        let key = first.key();

        let (a, b) = tokio::join!(f.sync.sync_change(first), f.sync.sync_change(second));
        for report in [&a, &b] {
            assert!(
                matches!(report.status, SyncStatus::Completed | SyncStatus::Duplicate),
                "{report:?}"
            );
        }

        let reference = f.sync.cache_entry(&lead_targets()[0], &key).unwrap();
        for hub in lead_targets() {
            let entry = f.sync.cache_entry(&hub, &key).unwrap();
            assert_eq!(entry.fields, reference.fields, "{hub}");
            assert_eq!(entry.field_writers, reference.field_writers, "{hub}");
            assert_eq!(entry.last_writer.event_id, reference.last_writer.event_id, "{hub}");
            assert_eq!(entry.version, reference.version, "{hub}");

            let mut applied: Vec<u64> = [&a, &b]
                .iter()
                .flat_map(|r| r.hub_results.iter())
                .filter(|r| r.hub == hub && r.status == HubSyncStatus::Applied)
                .filter_map(|r| r.version)
                .collect();
            applied.sort_unstable();
            let expected: Vec<u64> = (1..=entry.version).collect();
            assert_eq!(applied, expected, "{hub}");
        }
        assert!(reference.version >= 1);
    }

    #[tokio::test]
    async fn resubmitting_applied_event_is_a_duplicate() {
        let f = fixture();
        let event = lead_change(1).set("stage", json!("new"));
        f.sync.sync_change(event.clone()).await;
        let before = f.sync.cache_entry(&HubId::executive(), &event.key()).unwrap();

        let again = f.sync.sync_change(event.clone()).await;
        assert_eq!(again.status, SyncStatus::Duplicate);
        assert!(again.hub_results.is_empty());
        let after = f.sync.cache_entry(&HubId::executive(), &event.key()).unwrap();
        assert_eq!(before.version, after.version);
    }

    #[tokio::test]
    async fn invalid_email_updates_no_hub() {
        let f = fixture();
        let event = lead_change(1).set("email", json!("not-an-email"));
        let report = f.sync.sync_change(event.clone()).await;

        assert_eq!(report.status, SyncStatus::ValidationFailed);
        assert_eq!(report.validation_errors[0].code, "invalid_email");
        for hub in HubId::standard() {
            assert!(f.sync.cache_entry(&hub, &event.key()).is_none());
        }
        assert_eq!(f.sync.metrics().validation_failed, 1);
    }

    #[tokio::test]
    async fn unroutable_event_reports_routing_failure() {
        let f = fixture_with(Vec::new(), SynchronizerConfig::default());
        let report = f.sync.sync_change(lead_change(1).set("stage", json!("new"))).await;
        assert_eq!(report.status, SyncStatus::RoutingFailed);
        assert!(report.routing_error.is_some());
    }

    #[tokio::test]
    async fn late_arrival_of_older_write_does_not_overwrite() {
        let f = fixture_with(
            default_topology(),
            SynchronizerConfig::default().with_conflict_window(Duration::from_secs(60)),
        );
        let newer = lead_change(2)
            .set("stage", json!("qualified"))
            .with_strategy(ConflictStrategy::LastWriteWins);
        let older = lead_change(1)
            .set("stage", json!("new"))
            .with_strategy(ConflictStrategy::LastWriteWins);

        f.sync.sync_change(newer.clone()).await;
        let report = f.sync.sync_change(older).await;

        assert_eq!(report.winner_event_id, Some(newer.id));
        assert!(report.conflict.is_some());
        let entry = f.sync.cache_entry(&HubId::executive(), &newer.key()).unwrap();
        assert_eq!(entry.field("stage"), Some(&json!("qualified")));
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn failed_hub_is_queued_and_retried() {
        let f = fixture();
        f.caches.get(&HubId::sales_copilot()).unwrap().set_available(false);

        let event = lead_change(1).set("stage", json!("contacted"));
        let report = f.sync.sync_change(event.clone()).await;
        assert_eq!(report.status, SyncStatus::Partial);
        assert_eq!(
            report.hub(&HubId::sales_copilot()).unwrap().error,
            Some(ApplyFailure::Unavailable { hub: HubId::sales_copilot() })
        );
        assert_eq!(report.hub(&HubId::executive()).unwrap().status, HubSyncStatus::Applied);
        assert_eq!(f.sync.queued_retries(&HubId::sales_copilot()), 1);

        f.caches.get(&HubId::sales_copilot()).unwrap().set_available(true);
        let retried = f.sync.retry_failed(&HubId::sales_copilot()).await;
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].status, HubSyncStatus::Applied);
        assert_eq!(f.sync.queued_retries(&HubId::sales_copilot()), 0);
        let entry = f.sync.cache_entry(&HubId::sales_copilot(), &event.key()).unwrap();
        assert_eq!(entry.field("stage"), Some(&json!("contacted")));

        let again = f.sync.sync_change(event).await;
        assert_eq!(again.status, SyncStatus::Duplicate);
    }

    #[tokio::test]
    async fn slow_hub_times_out_without_blocking_others() {
        let f = fixture_with(
            default_topology(),
            SynchronizerConfig::default().with_apply_timeout(Duration::from_millis(50)),
        );
        f.caches
            .get(&HubId::automation_studio())
            .unwrap()
            .set_latency(Duration::from_millis(500));

        let report = f.sync.sync_change(lead_change(1).set("stage", json!("new"))).await;
        assert_eq!(report.status, SyncStatus::Partial);
        assert!(matches!(
            report.hub(&HubId::automation_studio()).unwrap().error,
            Some(ApplyFailure::Timeout { timeout_ms: 50, .. })
        ));
        assert_eq!(report.applied_hubs().len(), 2);
    }

    #[tokio::test]
    async fn manual_review_queues_and_adjudicates() {
        let f = fixture();
        let first = lead_change(1)
            .set("stage", json!("qualified"))
            .with_priority(Priority::High)
            .with_strategy(ConflictStrategy::ManualReview);
        let second = lead_change(2)
            .set("stage", json!("lost"))
            .with_strategy(ConflictStrategy::ManualReview);

        f.sync.sync_change(first.clone()).await;
        let report = f.sync.sync_change(second.clone()).await;

        let review_id = report.conflict.as_ref().and_then(|c| c.review_id).unwrap();
        assert_eq!(report.winner_event_id, Some(first.id));
        assert_eq!(f.sync.pending_reviews().len(), 1);
        assert!(!f.broker.published_on("hubflow:notifications").is_empty());

        let decided = f.sync.adjudicate(review_id, second.id).await.unwrap();
        assert_eq!(decided.status, SyncStatus::Completed);
        let entry = f.sync.cache_entry(&HubId::executive(), &second.key()).unwrap();
        assert_eq!(entry.field("stage"), Some(&json!("lost")));
        assert!(f.sync.pending_reviews().is_empty());

        assert_eq!(
            f.sync.adjudicate(review_id, second.id).await.unwrap_err(),
            ReviewError::NotFound(review_id)
        );
    }

    #[tokio::test]
    async fn critical_competitor_publishes_notification() {
        let f = fixture();
        let critical = lead_change(1)
            .set("stage", json!("escalated"))
            .with_priority(Priority::Critical);
        f.sync.sync_change(critical).await;
        f.sync.sync_change(lead_change(2).set("stage", json!("new"))).await;

        let published = f.broker.published_on("hubflow:notifications");
        assert_eq!(published.len(), 1);
        let n: Notification = serde_json::from_str(&published[0]).unwrap();
        assert_eq!(n.kind, NotificationKind::CriticalConflict);
    }

    #[tokio::test]
    async fn version_merge_combines_fields_from_competitors() {
        let f = fixture();
        let agent = |hub: HubId, at: i64| {
            ChangeEvent::update(hub, EntityType::Agent, "agent_9", "u")
                .at(t(at))
                .with_strategy(ConflictStrategy::VersionMerge)
        };
        f.sync
            .sync_change(agent(HubId::ops_optimization(), 1).set("region", json!("north")))
            .await;
        let report = f
            .sync
            .sync_change(agent(HubId::ops_optimization(), 2).set("capacity", json!(12)))
            .await;

        assert!(report.conflict.as_ref().is_some_and(|c| c.merged));
        let entry = f
            .sync
            .cache_entry(&HubId::executive(), &EntityKey::new(EntityType::Agent, "agent_9"))
            .unwrap();
        assert_eq!(entry.field("region"), Some(&json!("north")));
        assert_eq!(entry.field("capacity"), Some(&json!(12)));
    }

    #[tokio::test]
    async fn broker_outage_is_reported_not_masked() {
        let f = fixture();
        f.broker.set_unavailable(true);
        let report = f.sync.sync_change(lead_change(1).set("stage", json!("new"))).await;
        assert_eq!(report.status, SyncStatus::Completed);
        assert!(!report.broker_errors.is_empty());
    }

    #[tokio::test]
    async fn applied_hubs_receive_channel_payloads() {
        let f = fixture();
        let mut sub = f.broker.subscribe(&hub_sync_channel(&HubId::executive()));
        let event = lead_change(1).set("stage", json!("new"));
        f.sync.sync_change(event.clone()).await;

        let raw = sub.try_recv().unwrap();
        let envelope: HubEnvelope<ChangeEvent> = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope.payload().id, event.id);
        assert!(f.broker.get(&event_key(event.id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_evicts_state_after_ttl() {
        let f = fixture_with(
            default_topology(),
            SynchronizerConfig::default().with_state_ttl(Duration::from_secs(60)),
        );
        f.sync.sync_change(lead_change(1).set("stage", json!("new"))).await;

        assert_eq!(f.sync.sweep(Instant::now()).total(), 0);
        let stats = f.sync.sweep(Instant::now() + Duration::from_secs(120));
        assert_eq!(stats.recent_events, 1);
        assert_eq!(stats.applied_ids, 1);
    }

    #[tokio::test]
    async fn sink_reports_status_label() {
        let f = fixture();
        let outcome = f.sync.submit(lead_change(1).set("email", json!("bad"))).await;
        assert_eq!(outcome.status, "validation_failed");
        assert!(outcome.detail.unwrap().starts_with("email"));
    }
}
