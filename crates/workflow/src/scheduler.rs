//! Dependency-aware execution of one workflow.
//!
//! Parallel mode keeps a ready set: every pending action whose dependencies
//! have all completed (or been bypassed) is dispatched as its own task once a
//! semaphore permit is free, and results fan back in over a channel. Each
//! completion re-evaluates readiness and branch conditions. Sequential mode
//! runs actions in list order and stops at the first failure.
//!
//! On failure with `rollback_on_failure`, nothing new is dispatched, in-flight
//! actions finish, then the failed action and every completed action are
//! compensated in reverse finish order. Without rollback, dependents of a failed action are
//! skipped while independent branches keep running.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tracing::{info, instrument, warn};

use hubflow_core::{ChangeEvent, ExecutionId, HubId, WorkflowId};
use hubflow_events::SinkOutcome;

use crate::executor::{ActionError, ActionExecutor, ActionRun};
use crate::graph;
use crate::model::{
    Action, ActionId, ActionStatus, ExecutionMode, LogEvent, UnifiedWorkflow, WorkflowContext,
    WorkflowStatus,
};

/// Shared flag asking a running workflow to stop dispatching new actions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum simultaneously executing actions per workflow.
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrency: 10 }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub action_id: ActionId,
    pub hub: HubId,
    pub status: ActionStatus,
    pub attempts: u32,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ActionError>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub compensated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub action_id: ActionId,
    pub error: ActionError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Compensated actions, in the order compensation ran.
    pub compensated: Vec<ActionId>,
    pub failed: Vec<CompensationFailure>,
}

/// Everything one execution did, including what went wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub actions: Vec<ActionReport>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Actions whose branch condition did not hold.
    #[serde(default)]
    pub bypassed: usize,
    pub success_rate: f64,
    #[serde(default)]
    pub rollback: Option<RollbackReport>,
    /// Change events from completed, uncompensated actions in completion order.
    #[serde(default)]
    pub change_events: Vec<ChangeEvent>,
    /// What the change sink said about each forwarded event.
    #[serde(default)]
    pub forwarded: Vec<SinkOutcome>,
    #[serde(default)]
    pub broker_errors: Vec<String>,
}

impl ExecutionReport {
    pub fn action(&self, id: &str) -> Option<&ActionReport> {
        self.actions.iter().find(|a| a.action_id.as_str() == id)
    }
}

struct Finished {
    index: usize,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    run: ActionRun,
}

#[derive(Default)]
struct Tracker {
    runs: HashMap<usize, (u32, Duration, Option<ActionError>)>,
    /// Completed and failed actions, in the order they finished.
    finish_order: Vec<usize>,
    change_events: HashMap<usize, Vec<ChangeEvent>>,
}

#[derive(Debug, Clone)]
pub struct WorkflowScheduler {
    executor: ActionExecutor,
    config: SchedulerConfig,
}

impl WorkflowScheduler {
    pub fn new(executor: ActionExecutor, config: SchedulerConfig) -> Self {
        Self { executor, config }
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    /// Execute every action of `workflow`, mutating it in place.
    ///
    /// Never fails: per-action problems are captured in the report.
    #[instrument(skip_all, fields(workflow_id = %workflow.id, workflow = %workflow.name))]
    pub async fn execute(
        &self,
        workflow: &mut UnifiedWorkflow,
        cancel: &CancelToken,
    ) -> ExecutionReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        workflow.status = WorkflowStatus::Executing;
        workflow.context.started_at = Some(started_at);
        workflow.log(
            LogEvent::WorkflowStarted,
            None,
            Some(format!("{} actions, {:?} mode", workflow.actions.len(), workflow.mode)),
        );
        info!(actions = workflow.actions.len(), mode = ?workflow.mode, "workflow started");

        let mut tracker = Tracker::default();
        match workflow.mode {
            ExecutionMode::Parallel => self.run_parallel(workflow, cancel, &mut tracker).await,
            ExecutionMode::Sequential => self.run_sequential(workflow, cancel, &mut tracker).await,
        }

        let cancelled = cancel.is_cancelled();
        for i in 0..workflow.actions.len() {
            if workflow.actions[i].status != ActionStatus::Pending {
                continue;
            }
            let (status, event) = if cancelled {
                (ActionStatus::Cancelled, LogEvent::ActionCancelled)
            } else {
                (ActionStatus::Skipped, LogEvent::ActionSkipped)
            };
            workflow.actions[i].status = status;
            let action = workflow.actions[i].clone();
            workflow.log(event, Some(&action), None);
        }

        let any_failed = workflow.count(ActionStatus::Failed) > 0;
        let rollback = if any_failed && workflow.rollback_on_failure {
            Some(self.rollback(workflow, &tracker.finish_order).await)
        } else {
            None
        };

        // Actions on branches not taken are not part of the run.
        let bypassed = workflow.count(ActionStatus::Bypassed);
        let total = workflow.actions.len() - bypassed;
        let completed = workflow.count(ActionStatus::Completed);
        workflow.success_rate = if total == 0 {
            1.0
        } else {
            completed as f64 / total as f64
        };
        workflow.status = if cancelled && workflow.count(ActionStatus::Cancelled) > 0 {
            WorkflowStatus::Cancelled
        } else if any_failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        let completed_at = Utc::now();
        workflow.context.completed_at = Some(completed_at);
        let final_event = match workflow.status {
            WorkflowStatus::Cancelled => LogEvent::WorkflowCancelled,
            WorkflowStatus::Failed => LogEvent::WorkflowFailed,
            _ => LogEvent::WorkflowCompleted,
        };
        workflow.log(
            final_event,
            None,
            Some(format!("success rate {:.2}", workflow.success_rate)),
        );

        let change_events = tracker
            .finish_order
            .iter()
            .filter(|&&i| {
                let action = &workflow.actions[i];
                action.status == ActionStatus::Completed && !action.compensated
            })
            .filter_map(|i| tracker.change_events.remove(i))
            .flatten()
            .collect();

        let actions = workflow
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let (attempts, elapsed, error) = tracker.runs.remove(&i).unwrap_or_default();
                ActionReport {
                    action_id: a.id.clone(),
                    hub: a.hub.clone(),
                    status: a.status,
                    attempts,
                    result: a.result.clone(),
                    error,
                    elapsed_ms: elapsed.as_millis() as u64,
                    started_at: a.started_at,
                    completed_at: a.completed_at,
                    compensated: a.compensated,
                }
            })
            .collect();

        info!(
            status = ?workflow.status,
            success_rate = workflow.success_rate,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "workflow finished"
        );

        ExecutionReport {
            execution_id: ExecutionId::new(),
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            status: workflow.status,
            started_at,
            completed_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            actions,
            completed,
            failed: workflow.count(ActionStatus::Failed),
            skipped: workflow.count(ActionStatus::Skipped),
            cancelled: workflow.count(ActionStatus::Cancelled),
            bypassed,
            success_rate: workflow.success_rate,
            rollback,
            change_events,
            forwarded: Vec::new(),
            broker_errors: Vec::new(),
        }
    }

    async fn run_parallel(
        &self,
        workflow: &mut UnifiedWorkflow,
        cancel: &CancelToken,
        tracker: &mut Tracker,
    ) {
        let deps = dependency_indices(workflow);

        let limit = workflow
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let (tx, mut rx) = mpsc::unbounded_channel::<Finished>();
        let mut in_flight = 0usize;
        let mut halted = false;

        loop {
            if !halted && !cancel.is_cancelled() {
                settle_conditions(workflow, &deps);
                let ready: Vec<usize> = (0..workflow.actions.len())
                    .filter(|&i| {
                        workflow.actions[i].status == ActionStatus::Pending
                            && dependencies_settled(workflow, &deps[i])
                    })
                    .collect();

                for i in ready {
                    // Only a free slot starts an action; the rest stay pending.
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let action = mark_started(workflow, i);
                    let executor = self.executor.clone();
                    let context = workflow.context.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let finished = run_guarded(executor, i, action, context).await;
                        drop(permit);
                        let _ = tx.send(finished);
                    });
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }
            let Some(finished) = rx.recv().await else {
                break;
            };
            in_flight -= 1;

            let index = finished.index;
            if !record(workflow, finished, tracker) {
                continue;
            }
            if workflow.rollback_on_failure {
                if !halted {
                    halted = true;
                    warn!("action failed; halting dispatch for rollback");
                }
            } else {
                skip_dependents(workflow, index);
            }
        }
    }

    async fn run_sequential(
        &self,
        workflow: &mut UnifiedWorkflow,
        cancel: &CancelToken,
        tracker: &mut Tracker,
    ) {
        let deps = dependency_indices(workflow);
        for i in 0..workflow.actions.len() {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(reason) = bypass_reason(workflow, i, &deps[i]) {
                bypass(workflow, i, reason);
                continue;
            }
            let action = mark_started(workflow, i);
            let finished =
                run_guarded(self.executor.clone(), i, action, workflow.context.clone()).await;
            if record(workflow, finished, tracker) {
                break;
            }
        }
    }

    /// Compensate every finished action (failed ones included), most recent
    /// first. Each compensation runs once; failures are recorded, not retried.
    async fn rollback(&self, workflow: &mut UnifiedWorkflow, finish_order: &[usize]) -> RollbackReport {
        let mut report = RollbackReport::default();
        workflow.log(
            LogEvent::RollbackStarted,
            None,
            Some(format!("{} finished actions to compensate", finish_order.len())),
        );
        warn!(to_compensate = finish_order.len(), "rolling back workflow");

        for &i in finish_order.iter().rev() {
            let action = workflow.actions[i].clone();
            match self.executor.compensate(&action, &workflow.context).await {
                Ok(()) => {
                    workflow.actions[i].compensated = true;
                    workflow.log(LogEvent::ActionCompensated, Some(&action), None);
                    report.compensated.push(action.id.clone());
                }
                Err(error) => {
                    warn!(action_id = %action.id, hub = %action.hub, error = %error, "compensation failed");
                    workflow.log(
                        LogEvent::CompensationFailed,
                        Some(&action),
                        Some(error.to_string()),
                    );
                    report.failed.push(CompensationFailure {
                        action_id: action.id.clone(),
                        error,
                    });
                }
            }
        }
        report
    }
}

/// Completed and bypassed dependencies both let a dependent proceed.
fn dependencies_settled(workflow: &UnifiedWorkflow, deps: &[usize]) -> bool {
    deps.iter().all(|&d| {
        matches!(
            workflow.actions[d].status,
            ActionStatus::Completed | ActionStatus::Bypassed
        )
    })
}

/// Bypass pending actions whose guard is false or whose every upstream
/// action was bypassed, until nothing changes.
fn settle_conditions(workflow: &mut UnifiedWorkflow, deps: &[Vec<usize>]) {
    loop {
        let mut changed = false;
        for i in 0..workflow.actions.len() {
            if workflow.actions[i].status != ActionStatus::Pending
                || !dependencies_settled(workflow, &deps[i])
            {
                continue;
            }
            if let Some(reason) = bypass_reason(workflow, i, &deps[i]) {
                bypass(workflow, i, reason);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn dependency_indices(workflow: &UnifiedWorkflow) -> Vec<Vec<usize>> {
    let index: HashMap<&ActionId, usize> = workflow
        .actions
        .iter()
        .enumerate()
        .map(|(i, a)| (&a.id, i))
        .collect();
    workflow
        .actions
        .iter()
        .map(|a| a.depends_on.iter().filter_map(|d| index.get(d).copied()).collect())
        .collect()
}

/// Why action `i` is off the taken branch, if it is.
fn bypass_reason(workflow: &UnifiedWorkflow, i: usize, deps: &[usize]) -> Option<String> {
    let upstream_bypassed = !deps.is_empty()
        && deps
            .iter()
            .all(|&d| workflow.actions[d].status == ActionStatus::Bypassed);
    if upstream_bypassed {
        return Some("every upstream action was bypassed".to_string());
    }
    unmet_condition(workflow, i)
}

fn unmet_condition(workflow: &UnifiedWorkflow, i: usize) -> Option<String> {
    let condition = workflow.actions[i].condition.as_ref()?;
    let result = workflow
        .action(&condition.source)
        .and_then(|a| a.result.as_ref());
    (!condition.holds(result)).then(|| {
        format!(
            "condition on {}.{} ({:?}) not met",
            condition.source, condition.field, condition.operator
        )
    })
}

fn bypass(workflow: &mut UnifiedWorkflow, i: usize, reason: String) {
    workflow.actions[i].status = ActionStatus::Bypassed;
    let action = workflow.actions[i].clone();
    info!(action_id = %action.id, reason = %reason, "action bypassed");
    workflow.log(LogEvent::ActionBypassed, Some(&action), Some(reason));
}

/// Mark every pending transitive dependent of a failed action as skipped.
fn skip_dependents(workflow: &mut UnifiedWorkflow, failed: usize) {
    let root = workflow.actions[failed].id.clone();
    for id in graph::dependents_of(&workflow.actions, &root) {
        let Some(i) = workflow.actions.iter().position(|a| a.id == id) else {
            continue;
        };
        if workflow.actions[i].status != ActionStatus::Pending {
            continue;
        }
        workflow.actions[i].status = ActionStatus::Skipped;
        let action = workflow.actions[i].clone();
        workflow.log(
            LogEvent::ActionSkipped,
            Some(&action),
            Some(format!("depends on failed action {root}")),
        );
    }
}

fn mark_started(workflow: &mut UnifiedWorkflow, i: usize) -> Action {
    workflow.actions[i].status = ActionStatus::Executing;
    workflow.actions[i].started_at = Some(Utc::now());
    let action = workflow.actions[i].clone();
    workflow.log(LogEvent::ActionStarted, Some(&action), None);
    action
}

/// Run one action in its own task so a panicking handler fails only that action.
async fn run_guarded(
    executor: ActionExecutor,
    index: usize,
    action: Action,
    context: WorkflowContext,
) -> Finished {
    let started_at = Utc::now();
    let clock = Instant::now();
    let task = tokio::spawn(async move { executor.run(&action, &context).await });
    let run = match task.await {
        Ok(run) => run,
        Err(join_error) => {
            let error = ActionError::Handler {
                message: format!("handler task aborted: {join_error}"),
                attempts: 1,
                exhausted: false,
            };
            ActionRun {
                attempt_errors: vec![error.to_string()],
                outcome: Err(error),
                attempts: 1,
                elapsed: clock.elapsed(),
            }
        }
    };
    Finished {
        index,
        started_at,
        completed_at: Utc::now(),
        run,
    }
}

/// Fold a finished run into the workflow; returns whether the action failed.
fn record(workflow: &mut UnifiedWorkflow, finished: Finished, tracker: &mut Tracker) -> bool {
    let Finished {
        index,
        started_at,
        completed_at,
        run,
    } = finished;

    {
        let action = &mut workflow.actions[index];
        action.started_at = Some(started_at);
        action.completed_at = Some(completed_at);
        action.retry_count = run.attempts.saturating_sub(1);
    }

    let snapshot = workflow.actions[index].clone();
    let retried = run.attempt_errors.len().min(run.attempts.saturating_sub(1) as usize);
    for error in run.attempt_errors.iter().take(retried) {
        workflow.log(LogEvent::ActionRetried, Some(&snapshot), Some(error.clone()));
    }

    tracker.finish_order.push(index);
    match run.outcome {
        Ok(output) => {
            let action = &mut workflow.actions[index];
            action.status = ActionStatus::Completed;
            action.result = Some(output.result);
            if !output.change_events.is_empty() {
                tracker.change_events.insert(index, output.change_events);
            }
            tracker.runs.insert(index, (run.attempts, run.elapsed, None));
            workflow.log(LogEvent::ActionCompleted, Some(&snapshot), None);
            false
        }
        Err(error) => {
            let action = &mut workflow.actions[index];
            action.status = ActionStatus::Failed;
            action.error = Some(error.to_string());
            workflow.log(
                LogEvent::ActionFailed,
                Some(&snapshot),
                Some(error.to_string()),
            );
            tracker.runs.insert(index, (run.attempts, run.elapsed, Some(error)));
            true
        }
    }
}
