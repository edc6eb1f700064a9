//! Seam between workflow execution and data synchronization.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use hubflow_core::{ChangeEvent, EventId};

/// Result of handing one change event to a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkOutcome {
    pub event_id: EventId,
    /// Sink-defined status label (e.g. `completed`, `partial`, `duplicate`).
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SinkOutcome {
    pub fn new(event_id: EventId, status: impl Into<String>) -> Self {
        Self {
            event_id,
            status: status.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Anything that accepts change events produced by workflow actions.
///
/// The synchronizer implements this; the orchestrator only sees the trait.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn submit(&self, event: ChangeEvent) -> SinkOutcome;
}
