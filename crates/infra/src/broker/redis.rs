//! Redis-backed broker (optional).
//!
//! Key/value commands share one multiplexed async connection. Subscriptions
//! each get a dedicated blocking connection on a background thread, because
//! a pub/sub connection cannot issue other commands.
//!
//! Note: Redis pub/sub is not durable; subscribers that are offline when a
//! payload is published never see it.

use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::{OnceCell, mpsc};
use tracing::{debug, warn};

use hubflow_events::{Broker, BrokerError, Subscription};

/// How often a subscriber thread wakes up to notice a dropped subscription.
const SUBSCRIBER_POLL: Duration = Duration::from_millis(500);

pub struct RedisBroker {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
}

impl RedisBroker {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(connection_error)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.connection
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(connection_error)
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(command_error)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        conn.set(key, value).await.map_err(command_error)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(command_error)?;
        Ok(removed > 0)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError> {
        let mut conn = self.conn().await?;
        let receivers: i64 = conn.publish(channel, payload).await.map_err(command_error)?;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn().await?;
        let mut keys: Vec<String> = conn.keys(pattern).await.map_err(command_error)?;
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = self.client.clone();
        let channel_name = channel.to_string();

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(channel = %channel_name, error = %e, "redis subscriber failed to connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if pubsub.subscribe(&channel_name).is_err() {
                return;
            }
            if pubsub.set_read_timeout(Some(SUBSCRIBER_POLL)).is_err() {
                return;
            }

            loop {
                if tx.is_closed() {
                    debug!(channel = %channel_name, "subscription dropped");
                    return;
                }
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(e) if e.is_timeout() => continue,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                if tx.send(payload).is_err() {
                    return;
                }
            }
        });

        Subscription::new(channel, rx)
    }
}

fn connection_error(e: redis::RedisError) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

fn command_error(e: redis::RedisError) -> BrokerError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
        BrokerError::Connection(e.to_string())
    } else {
        BrokerError::Command(e.to_string())
    }
}
