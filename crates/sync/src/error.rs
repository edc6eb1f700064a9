use serde::{Deserialize, Serialize};
use thiserror::Error;

use hubflow_core::{EntityType, HubId, ReviewId};

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    /// Stable machine-readable code (`invalid_email`, `out_of_range`, ...).
    pub code: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("validation failed with {} field error(s)", .errors.len())]
pub struct ValidationFailed {
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no events to resolve")]
    Empty,
    #[error("competing events refer to different entities")]
    MixedEntities,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no target hubs for {entity_type} events from '{source_hub}'")]
    NoTargets {
        source_hub: HubId,
        entity_type: EntityType,
    },
}

/// Why delivery to one hub failed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyFailure {
    #[error("hub '{hub}' is unavailable")]
    Unavailable { hub: HubId },
    #[error("apply to '{hub}' timed out after {timeout_ms} ms")]
    Timeout { hub: HubId, timeout_ms: u64 },
    #[error("no cache registered for hub '{hub}'")]
    UnknownHub { hub: HubId },
    #[error("apply task for '{hub}' aborted: {reason}")]
    Aborted { hub: HubId, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReviewError {
    #[error("review item not found: {0}")]
    NotFound(ReviewId),
    #[error("event is not part of review {0}")]
    UnknownEvent(ReviewId),
}
