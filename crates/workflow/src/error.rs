use thiserror::Error;

use hubflow_core::WorkflowId;

use crate::model::{ActionId, WorkflowStatus};

/// Structural and lifecycle errors surfaced synchronously by the orchestrator.
///
/// Per-action failures never appear here; they are values inside an
/// `ExecutionReport`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("cyclic dependency between actions: {}", format_ids(.cycle))]
    CyclicDependency { cycle: Vec<ActionId> },

    #[error("action '{action}' depends on unknown action '{missing}'")]
    UnknownDependency { action: ActionId, missing: ActionId },

    #[error("condition of action '{action}' reads '{on}', which is not one of its dependencies")]
    ConditionOutsideDependencies { action: ActionId, on: ActionId },

    #[error("duplicate action id '{0}'")]
    DuplicateActionId(ActionId),

    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),

    #[error("workflow {id} cannot {operation} from status {from:?}")]
    InvalidTransition {
        id: WorkflowId,
        from: WorkflowStatus,
        operation: &'static str,
    },

    #[error("template not found: {0}")]
    TemplateNotFound(String),
}

fn format_ids(ids: &[ActionId]) -> String {
    ids.iter()
        .map(ActionId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
