//! Cross-hub notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hubflow_core::{HubId, Priority};

use crate::broker::{Broker, BrokerError, publish_json};
use crate::keys::{NOTIFICATION_CHANNEL, hub_notify_channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    WorkflowCompleted,
    WorkflowFailed,
    CriticalConflict,
    ManualReviewRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub source_hub: HubId,
    pub target_hubs: Vec<HubId>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        source_hub: HubId,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            title: title.into(),
            message: message.into(),
            source_hub,
            target_hubs: Vec::new(),
            priority: Priority::Medium,
            created_at: Utc::now(),
        }
    }

    pub fn to_hubs(mut self, hubs: impl IntoIterator<Item = HubId>) -> Self {
        self.target_hubs = hubs.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Publish on every target hub's channel and mirror to the global channel.
///
/// Stops at the first broker error.
pub async fn publish_notification(
    broker: &dyn Broker,
    notification: &Notification,
) -> Result<(), BrokerError> {
    for hub in &notification.target_hubs {
        publish_json(broker, &hub_notify_channel(hub), notification).await?;
    }
    publish_json(broker, NOTIFICATION_CHANNEL, notification).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryBroker;

    #[tokio::test]
    async fn notification_reaches_each_target_and_global_channel() {
        let broker = InMemoryBroker::new();
        let n = Notification::new(
            NotificationKind::WorkflowCompleted,
            HubId::automation_studio(),
            "Workflow completed",
            "lead qualification finished",
        )
        .to_hubs([HubId::executive(), HubId::sales_copilot()]);

        publish_notification(&broker, &n).await.unwrap();

        assert_eq!(broker.published_on(&hub_notify_channel(&HubId::executive())).len(), 1);
        assert_eq!(broker.published_on(&hub_notify_channel(&HubId::sales_copilot())).len(), 1);
        let global = broker.published_on(NOTIFICATION_CHANNEL);
        let decoded: Notification = serde_json::from_str(&global[0]).unwrap();
        assert_eq!(decoded.kind, NotificationKind::WorkflowCompleted);
    }
}
