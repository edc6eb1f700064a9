//! Cross-hub workflow execution.
//!
//! - `model`: workflows, actions and their context
//! - `graph`: creation-time dependency validation
//! - `condition`: branch guards over a dependency's result
//! - `executor`: hub handlers and single-action execution (timeout + retry)
//! - `scheduler`: dependency-aware parallel execution with rollback
//! - `orchestrator`: the public API (create / execute / cancel / query)

pub mod analytics;
pub mod condition;
pub mod error;
pub mod executor;
pub mod graph;
pub mod insight;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod templates;

pub use analytics::{WindowStats, WorkflowAnalytics};
pub use condition::{Condition, ConditionOperator};
pub use error::WorkflowError;
pub use executor::{ActionError, ActionExecutor, FnHandler, HandlerError, HubHandler, HubRegistry};
pub use insight::{Insight, InsightError, InsightHandler, InsightService};
pub use model::{
    Action, ActionId, ActionOutput, ActionStatus, ExecutionMode, TriggerSource, UnifiedWorkflow,
    WorkflowContext, WorkflowOptions, WorkflowStatus,
};
pub use orchestrator::{OrchestratorConfig, WorkflowOrchestrator};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{
    ActionReport, CancelToken, ExecutionReport, RollbackReport, SchedulerConfig, WorkflowScheduler,
};
pub use templates::{TemplateLibrary, WorkflowTemplate};
