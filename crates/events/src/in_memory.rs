//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::{Broker, BrokerError, Subscription, glob_match};

/// Payloads kept per channel for `published_on`; older ones are dropped.
pub const HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    history: HashMap<String, VecDeque<String>>,
}

impl State {
    /// Drop expired entries, returning how many went.
    fn prune_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        before - self.entries.len()
    }
}

/// In-process broker.
///
/// - Expired keys are dropped on every write and listing, or by `sweep_expired`
/// - Best-effort fan-out; dead subscribers are dropped while publishing
/// - The last `HISTORY_LIMIT` payloads per channel are kept for assertions
/// - `set_unavailable(true)` makes every call fail, simulating an outage
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Recent payloads published on `channel`, oldest first.
    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.state
            .lock()
            .map(|s| {
                s.history
                    .get(channel)
                    .map(|h| h.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Remove every expired key now.
    pub fn sweep_expired(&self) -> Result<usize, BrokerError> {
        Ok(self.lock()?.prune_expired(Instant::now()))
    }

    /// Keys held in memory, expired ones not yet pruned included.
    pub fn stored_keys(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BrokerError::Connection("broker unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, BrokerError> {
        self.check()?;
        self.state.lock().map_err(|_| BrokerError::Poisoned)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        match state.entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state.prune_expired(Instant::now());
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        state.prune_expired(now);
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let mut state = self.lock()?;
        Ok(state.entries.remove(key).is_some())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError> {
        let mut state = self.lock()?;
        let history = state.history.entry(channel.to_string()).or_default();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(payload.clone());

        let Some(subs) = state.channels.get_mut(channel) else {
            return Ok(0);
        };
        subs.retain(|tx| tx.send(payload.clone()).is_ok());
        Ok(subs.len())
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut state = self.lock()?;
        state.prune_expired(Instant::now());
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut state) = self.state.lock() {
            state
                .channels
                .entry(channel.to_string())
                .or_default()
                .push(tx);
        }

        Subscription::new(channel, rx)
    }
}
