//! Process wiring: broker, hub handlers, orchestrator and synchronizer.

pub mod handlers;
pub mod runtime;

pub use runtime::{Node, NodeError, build_broker, standard_registry};
