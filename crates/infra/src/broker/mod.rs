//! Infrastructure broker implementations.
//!
//! The `Broker` abstraction lives in `hubflow-events` as pure mechanics.
//! This module provides network-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;
