//! Broker key and channel naming.

use hubflow_core::{EventId, HubId, WorkflowId};

/// Channel every cross-hub notification is mirrored to.
pub const NOTIFICATION_CHANNEL: &str = "hubflow:notifications";

pub const WORKFLOW_KEY_PATTERN: &str = "hubflow:workflow:*";
pub const SYNC_EVENT_KEY_PATTERN: &str = "hubflow:sync:event:*";

pub fn workflow_key(id: WorkflowId) -> String {
    format!("hubflow:workflow:{id}")
}

pub fn event_key(id: EventId) -> String {
    format!("hubflow:sync:event:{id}")
}

/// Channel carrying synchronized change payloads for one hub.
pub fn hub_sync_channel(hub: &HubId) -> String {
    format!("hubflow:hub:{hub}:sync")
}

/// Channel carrying notifications addressed to one hub.
pub fn hub_notify_channel(hub: &HubId) -> String {
    format!("hubflow:hub:{hub}:notifications")
}
