//! Workflow data model.
//!
//! A `UnifiedWorkflow` owns its `WorkflowContext` and an ordered list of
//! `Action`s. The orchestrator creates workflows; only the scheduler mutates
//! them while they execute. Once a workflow reaches a terminal status its
//! actions are frozen and only the execution log may grow.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use hubflow_core::{ChangeEvent, HubId, Priority, WorkflowId};

use crate::condition::Condition;
use crate::retry::RetryPolicy;

pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Action identifier, unique within its workflow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ActionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ActionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Manual,
    Scheduled,
    Webhook,
    EventDriven,
    Api,
}

/// Execution context shared by every action of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub user_id: String,
    pub session_id: String,
    pub primary_hub: HubId,
    #[serde(default)]
    pub secondary_hubs: Vec<HubId>,
    #[serde(default)]
    pub lead_id: Option<String>,
    #[serde(default)]
    pub deal_id: Option<String>,
    #[serde(default)]
    pub property_id: Option<String>,
    #[serde(default)]
    pub trigger: TriggerSource,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowContext {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>, primary_hub: HubId) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            primary_hub,
            secondary_hubs: Vec::new(),
            lead_id: None,
            deal_id: None,
            property_id: None,
            trigger: TriggerSource::default(),
            priority: Priority::default(),
            deadline: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_secondary_hubs(mut self, hubs: impl IntoIterator<Item = HubId>) -> Self {
        self.secondary_hubs = hubs.into_iter().collect();
        self
    }

    pub fn with_lead(mut self, lead_id: impl Into<String>) -> Self {
        self.lead_id = Some(lead_id.into());
        self
    }

    pub fn with_deal(mut self, deal_id: impl Into<String>) -> Self {
        self.deal_id = Some(deal_id.into());
        self
    }

    pub fn with_property(mut self, property_id: impl Into<String>) -> Self {
        self.property_id = Some(property_id.into());
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSource) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
    /// Never started because a dependency failed or the run stopped early.
    Skipped,
    Cancelled,
    /// Not on the taken branch: its condition did not hold.
    Bypassed,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActionStatus::Pending | ActionStatus::Executing)
    }
}

/// One schedulable unit of work owned by a single hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub hub: HubId,
    pub action_type: String,
    pub target: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub depends_on: Vec<ActionId>,
    /// Guard over a dependency's result; the action is bypassed when false.
    #[serde(default)]
    pub condition: Option<Condition>,
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once a compensating handler ran successfully for this action.
    #[serde(default)]
    pub compensated: bool,
}

impl Action {
    pub fn new(
        id: impl Into<ActionId>,
        hub: HubId,
        action_type: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            hub,
            action_type: action_type.into(),
            target: target.into(),
            parameters: BTreeMap::new(),
            depends_on: Vec::new(),
            condition: None,
            timeout: DEFAULT_ACTION_TIMEOUT,
            retry: RetryPolicy::default(),
            retry_count: 0,
            status: ActionStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            compensated: false,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn after(mut self, dependency: impl Into<ActionId>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    /// Run only when `condition` holds; its source becomes a dependency.
    pub fn when(mut self, condition: Condition) -> Self {
        if !self.depends_on.contains(&condition.source) {
            self.depends_on.push(condition.source.clone());
        }
        self.condition = Some(condition);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fresh copy with all runtime state cleared.
    pub fn reset(&self) -> Self {
        Self {
            retry_count: 0,
            status: ActionStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            compensated: false,
            ..self.clone()
        }
    }
}

/// What a hub handler hands back for a completed action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub result: JsonValue,
    /// Entity changes the action caused, to be propagated to other hubs.
    #[serde(default)]
    pub change_events: Vec<ChangeEvent>,
}

impl ActionOutput {
    pub fn new(result: JsonValue) -> Self {
        Self {
            result,
            change_events: Vec::new(),
        }
    }

    pub fn with_change(mut self, event: ChangeEvent) -> Self {
        self.change_events.push(event);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Independent actions run concurrently; dependents wait.
    #[default]
    Parallel,
    /// Actions run one at a time in list order, ignoring the graph.
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    WorkflowCreated,
    WorkflowStarted,
    ActionStarted,
    ActionRetried,
    ActionCompleted,
    ActionFailed,
    ActionSkipped,
    ActionCancelled,
    ActionBypassed,
    RollbackStarted,
    ActionCompensated,
    CompensationFailed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub event: LogEvent,
    #[serde(default)]
    pub action_id: Option<ActionId>,
    #[serde(default)]
    pub hub: Option<HubId>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Options accepted by `CreateWorkflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOptions {
    pub mode: ExecutionMode,
    pub rollback_on_failure: bool,
    /// Per-workflow override of the scheduler's concurrency limit.
    pub max_concurrency: Option<usize>,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            rollback_on_failure: true,
            max_concurrency: None,
        }
    }
}

impl WorkflowOptions {
    pub fn sequential() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            ..Default::default()
        }
    }

    pub fn with_rollback(mut self, rollback_on_failure: bool) -> Self {
        self.rollback_on_failure = rollback_on_failure;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedWorkflow {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub actions: Vec<Action>,
    pub context: WorkflowContext,
    pub mode: ExecutionMode,
    pub rollback_on_failure: bool,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub execution_log: Vec<LogEntry>,
    /// Completed actions / total actions, set after execution.
    #[serde(default)]
    pub success_rate: f64,
    pub created_at: DateTime<Utc>,
}

impl UnifiedWorkflow {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        actions: Vec<Action>,
        context: WorkflowContext,
        options: WorkflowOptions,
    ) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: description.into(),
            actions,
            context,
            mode: options.mode,
            rollback_on_failure: options.rollback_on_failure,
            max_concurrency: options.max_concurrency,
            status: WorkflowStatus::Pending,
            execution_log: Vec::new(),
            success_rate: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn action(&self, id: &ActionId) -> Option<&Action> {
        self.actions.iter().find(|a| &a.id == id)
    }

    pub fn count(&self, status: ActionStatus) -> usize {
        self.actions.iter().filter(|a| a.status == status).count()
    }

    pub fn log(&mut self, event: LogEvent, action: Option<&Action>, detail: Option<String>) {
        self.execution_log.push(LogEntry {
            at: Utc::now(),
            event,
            action_id: action.map(|a| a.id.clone()),
            hub: action.map(|a| a.hub.clone()),
            detail,
        });
    }
}
