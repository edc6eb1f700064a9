//! Cross-hub data synchronization.
//!
//! A `DataSynchronizer` takes field-level `ChangeEvent`s from any hub,
//! validates them, resolves concurrent writes to the same entity, routes the
//! winner using static `SyncConfiguration`s and applies it to every target
//! hub's cache.

pub mod cache;
pub mod config;
pub mod error;
pub mod resolver;
pub mod router;
pub mod synchronizer;
pub mod validator;

pub use cache::{ApplyOutcome, CacheEntry, HubCache, HubCacheSet, LastWriter};
pub use config::{SyncConfiguration, SyncDirection, default_topology};
pub use error::{ApplyFailure, FieldError, ResolveError, ReviewError, RoutingError, ValidationFailed};
pub use resolver::{BusinessRule, ConflictResolver, Resolution};
pub use router::{HubRouter, Route};
pub use synchronizer::{
    ConflictReport, DataSynchronizer, HubResult, HubSyncStatus, ReviewItem, SweepStats,
    SyncMetrics, SyncReport, SyncStatus, SynchronizerConfig,
};
pub use validator::{DataValidator, FieldRule, ReferenceLookup};
