//! Broker, channels, notifications and the change-event sink.
//!
//! Everything the orchestrator and synchronizer share at runtime lives here
//! as traits plus an in-process implementation; network-backed brokers live
//! in `hubflow-infra`.

pub mod broker;
pub mod envelope;
pub mod in_memory;
pub mod keys;
pub mod notification;
pub mod sink;
pub mod sweeper;

pub use broker::{Broker, BrokerError, Subscription, load_json, publish_json, stage_json};
pub use envelope::HubEnvelope;
pub use in_memory::InMemoryBroker;
pub use notification::{Notification, NotificationKind, publish_notification};
pub use sink::{ChangeSink, SinkOutcome};
pub use sweeper::SweeperHandle;
