//! `hubflow-core`: shared primitives for cross-hub orchestration and sync.
//!
//! This crate is **pure data**: identifiers, hubs, priorities, entity keys and
//! the field-level `ChangeEvent`. No IO, no async.

pub mod change;
pub mod entity;
pub mod error;
pub mod hub;
pub mod id;
pub mod priority;

pub use change::{
    ChangeEvent, ChangeKind, ConflictStrategy, FieldChange, FieldMap, IntegrityLevel,
    ProcessingState,
};
pub use entity::{EntityKey, EntityType};
pub use error::{CoreError, CoreResult};
pub use hub::HubId;
pub use id::{EventId, ExecutionId, ReviewId, SyncId, WorkflowId};
pub use priority::Priority;
