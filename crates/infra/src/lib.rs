//! Infrastructure layer: network brokers and process configuration.

pub mod broker;
pub mod config;

pub use config::{ConfigError, HubflowConfig};
