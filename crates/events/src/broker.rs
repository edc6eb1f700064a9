//! Shared key-value broker abstraction (mechanics only).
//!
//! The broker is the one piece of shared infrastructure both the
//! orchestrator and the synchronizer talk to. It is used for:
//!
//! - **Staging**: in-flight workflows and change events are written under a
//!   TTL so other processes (and operators) can inspect them
//! - **Delivery**: per-hub pub/sub channels carry synchronized payloads and
//!   notifications
//!
//! ## Failure model
//!
//! The broker is assumed reachable. When it is not, every call returns a
//! `BrokerError`; callers record the error in their report instead of
//! retrying silently. Nothing here masks an outage.
//!
//! ## Delivery guarantees
//!
//! Pub/sub is fire-and-forget: subscribers that are not listening when a
//! message is published never see it. Durable state lives in the caches and
//! staged keys, not in channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("payload serialization error: {0}")]
    Serialization(String),

    /// Internal lock poisoned (in-process brokers only).
    #[error("broker state poisoned")]
    Poisoned,
}

/// A subscription to one broker channel.
///
/// Each subscription receives its own copy of every payload published on the
/// channel after it was created. Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next payload; `None` once the broker side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Take a payload if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for the next payload.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Key-value + pub/sub broker contract.
///
/// Implementations must be safe to share across tasks; every method may be
/// called concurrently.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    async fn set(&self, key: &str, value: String) -> Result<(), BrokerError>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration)
    -> Result<(), BrokerError>;

    /// Remove a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, BrokerError>;

    /// Publish a payload; returns the number of subscribers that received it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError>;

    /// Keys matching a glob pattern (`*` and `?` wildcards).
    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError>;

    fn subscribe(&self, channel: &str) -> Subscription;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BrokerError> {
        (**self).set(key, value).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        (**self).delete(key).await
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError> {
        (**self).publish(channel, payload).await
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        (**self).list_keys(pattern).await
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        (**self).subscribe(channel)
    }
}

/// Serialize `value` as JSON and stage it under `key` with a TTL.
pub async fn stage_json<T>(
    broker: &dyn Broker,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), BrokerError>
where
    T: Serialize + ?Sized,
{
    let payload =
        serde_json::to_string(value).map_err(|e| BrokerError::Serialization(e.to_string()))?;
    broker.set_with_ttl(key, payload, ttl).await
}

/// Load and deserialize a JSON value staged under `key`.
pub async fn load_json<T>(broker: &dyn Broker, key: &str) -> Result<Option<T>, BrokerError>
where
    T: DeserializeOwned,
{
    match broker.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| BrokerError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Serialize `value` as JSON and publish it on `channel`.
pub async fn publish_json<T>(
    broker: &dyn Broker,
    channel: &str,
    value: &T,
) -> Result<usize, BrokerError>
where
    T: Serialize + ?Sized,
{
    let payload =
        serde_json::to_string(value).map_err(|e| BrokerError::Serialization(e.to_string()))?;
    broker.publish(channel, payload).await
}

/// Glob match with `*` (any run) and `?` (any single char), Redis `KEYS`-style.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    let (mut pi, mut ki) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ki;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ki = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
