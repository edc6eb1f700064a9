use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hubflow_core::HubId;

/// Envelope for a payload delivered on a hub channel.
///
/// This is the unit published on `hubflow:hub:{hub}:sync` and the
/// notification channels.
///
/// Notes:
/// - `message_id` is unique per publish; retries produce a new envelope.
/// - `source_hub` is the hub that originated the payload, `target_hub` the
///   channel owner it was addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubEnvelope<P> {
    message_id: Uuid,
    source_hub: HubId,
    target_hub: HubId,
    published_at: DateTime<Utc>,
    payload: P,
}

impl<P> HubEnvelope<P> {
    pub fn new(source_hub: HubId, target_hub: HubId, payload: P) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            source_hub,
            target_hub,
            published_at: Utc::now(),
            payload,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn source_hub(&self) -> &HubId {
        &self.source_hub
    }

    pub fn target_hub(&self) -> &HubId {
        &self.target_hub
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}
