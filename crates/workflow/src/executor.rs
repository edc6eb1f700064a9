//! Routing a single action to its hub's handler, under timeout and retry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use hubflow_core::HubId;

use crate::model::{Action, ActionOutput, WorkflowContext};

/// Error returned by a hub handler for one attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum HandlerError {
    /// Worth retrying with the same parameters.
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help; the action fails immediately.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Tagged outcome of a failed action.
///
/// `exhausted` distinguishes "every allowed attempt failed" from a single
/// attempt that ended the run early (a permanent handler error).
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionError {
    #[error("timed out after {timeout_ms} ms on attempt {attempts}")]
    Timeout {
        timeout_ms: u64,
        attempts: u32,
        exhausted: bool,
    },

    #[error("handler failed on attempt {attempts}: {message}")]
    Handler {
        message: String,
        attempts: u32,
        exhausted: bool,
    },

    #[error("no handler registered for hub '{hub}'")]
    Routing { hub: HubId },

    #[error("cancelled before start")]
    Cancelled,
}

impl ActionError {
    pub fn is_exhausted(&self) -> bool {
        match self {
            ActionError::Timeout { exhausted, .. } | ActionError::Handler { exhausted, .. } => {
                *exhausted
            }
            ActionError::Routing { .. } | ActionError::Cancelled => false,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ActionError::Timeout { attempts, .. } | ActionError::Handler { attempts, .. } => {
                *attempts
            }
            ActionError::Routing { .. } | ActionError::Cancelled => 0,
        }
    }
}

/// A hub's action handler. This is the only extension point for new hubs.
#[async_trait]
pub trait HubHandler: Send + Sync {
    async fn handle(
        &self,
        action: &Action,
        context: &WorkflowContext,
    ) -> Result<ActionOutput, HandlerError>;

    /// Undo a previously completed action during rollback.
    async fn compensate(
        &self,
        _action: &Action,
        _context: &WorkflowContext,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

type CompensateFn = Arc<
    dyn Fn(Action, WorkflowContext) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// Closure-backed handler.
///
/// Closures receive owned copies so they can move them into `async` blocks.
pub struct FnHandler<F> {
    handle: F,
    compensate: Option<CompensateFn>,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Action, WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionOutput, HandlerError>> + Send + 'static,
{
    pub fn new(handle: F) -> Self {
        Self {
            handle,
            compensate: None,
        }
    }

    pub fn on_compensate<C, CFut>(mut self, compensate: C) -> Self
    where
        C: Fn(Action, WorkflowContext) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |action, context| {
            Box::pin(compensate(action, context))
        }));
        self
    }
}

#[async_trait]
impl<F, Fut> HubHandler for FnHandler<F>
where
    F: Fn(Action, WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionOutput, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        action: &Action,
        context: &WorkflowContext,
    ) -> Result<ActionOutput, HandlerError> {
        (self.handle)(action.clone(), context.clone()).await
    }

    async fn compensate(
        &self,
        action: &Action,
        context: &WorkflowContext,
    ) -> Result<(), HandlerError> {
        match &self.compensate {
            Some(compensate) => compensate(action.clone(), context.clone()).await,
            None => Ok(()),
        }
    }
}

/// Hub id -> handler table.
#[derive(Clone, Default)]
pub struct HubRegistry {
    handlers: HashMap<HubId, Arc<dyn HubHandler>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `hub`.
    pub fn register<H>(&mut self, hub: HubId, handler: H)
    where
        H: HubHandler + 'static,
    {
        self.handlers.insert(hub, Arc::new(handler));
    }

    pub fn register_shared(&mut self, hub: HubId, handler: Arc<dyn HubHandler>) {
        self.handlers.insert(hub, handler);
    }

    pub fn with<H>(mut self, hub: HubId, handler: H) -> Self
    where
        H: HubHandler + 'static,
    {
        self.register(hub, handler);
        self
    }

    pub fn get(&self, hub: &HubId) -> Option<Arc<dyn HubHandler>> {
        self.handlers.get(hub).cloned()
    }

    pub fn hubs(&self) -> Vec<HubId> {
        let mut hubs: Vec<HubId> = self.handlers.keys().cloned().collect();
        hubs.sort();
        hubs
    }
}

impl core::fmt::Debug for HubRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HubRegistry").field("hubs", &self.hubs()).finish()
    }
}

/// Result of running one action to completion (all attempts included).
#[derive(Debug, Clone)]
pub struct ActionRun {
    pub outcome: Result<ActionOutput, ActionError>,
    pub attempts: u32,
    /// Error text of each failed attempt, oldest first.
    pub attempt_errors: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ActionExecutor {
    registry: Arc<HubRegistry>,
}

impl ActionExecutor {
    pub fn new(registry: Arc<HubRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HubRegistry {
        &self.registry
    }

    /// Run `action` on its hub, retrying per its `RetryPolicy`.
    ///
    /// Each attempt is bounded by `action.timeout`; a timed-out attempt
    /// counts as a failure like any other.
    pub async fn run(&self, action: &Action, context: &WorkflowContext) -> ActionRun {
        let started = Instant::now();
        let Some(handler) = self.registry.get(&action.hub) else {
            warn!(action_id = %action.id, hub = %action.hub, "no handler registered for hub");
            return ActionRun {
                outcome: Err(ActionError::Routing {
                    hub: action.hub.clone(),
                }),
                attempts: 0,
                attempt_errors: Vec::new(),
                elapsed: started.elapsed(),
            };
        };

        let policy = &action.retry;
        let mut attempt_errors = Vec::new();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let retries_so_far = attempts - 1;
            let attempt = tokio::time::timeout(action.timeout, handler.handle(action, context)).await;

            let (error, stop_now) = match attempt {
                Ok(Ok(output)) => {
                    debug!(action_id = %action.id, hub = %action.hub, attempts, "action completed");
                    return ActionRun {
                        outcome: Ok(output),
                        attempts,
                        attempt_errors,
                        elapsed: started.elapsed(),
                    };
                }
                Ok(Err(e)) => {
                    let permanent = e.is_permanent();
                    (
                        ActionError::Handler {
                            message: e.to_string(),
                            attempts,
                            exhausted: !permanent,
                        },
                        permanent,
                    )
                }
                Err(_) => (
                    ActionError::Timeout {
                        timeout_ms: action.timeout.as_millis() as u64,
                        attempts,
                        exhausted: true,
                    },
                    false,
                ),
            };

            attempt_errors.push(error.to_string());

            if stop_now || !policy.allows_retry(retries_so_far) {
                warn!(
                    action_id = %action.id,
                    hub = %action.hub,
                    attempts,
                    error = %error,
                    "action failed"
                );
                return ActionRun {
                    outcome: Err(error),
                    attempts,
                    attempt_errors,
                    elapsed: started.elapsed(),
                };
            }

            let delay = policy.delay_for_retry(attempts);
            debug!(
                action_id = %action.id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying action"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Invoke the hub's compensating handler once, bounded by the action timeout.
    pub async fn compensate(
        &self,
        action: &Action,
        context: &WorkflowContext,
    ) -> Result<(), ActionError> {
        let Some(handler) = self.registry.get(&action.hub) else {
            return Err(ActionError::Routing {
                hub: action.hub.clone(),
            });
        };

        match tokio::time::timeout(action.timeout, handler.compensate(action, context)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ActionError::Handler {
                message: e.to_string(),
                attempts: 1,
                exhausted: false,
            }),
            Err(_) => Err(ActionError::Timeout {
                timeout_ms: action.timeout.as_millis() as u64,
                attempts: 1,
                exhausted: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context() -> WorkflowContext {
        WorkflowContext::new("user", "session", HubId::executive())
    }

    fn executor_with(hub: HubId, handler: impl HubHandler + 'static) -> ActionExecutor {
        ActionExecutor::new(Arc::new(HubRegistry::new().with(hub, handler)))
    }

    #[tokio::test]
    async fn routes_to_registered_hub() {
        let exec = executor_with(
            HubId::sales_copilot(),
            FnHandler::new(|action: Action, _ctx| async move {
                Ok(ActionOutput::new(serde_json::json!({ "target": action.target })))
            }),
        );
        let action = Action::new("a", HubId::sales_copilot(), "draft_email", "lead_1");
        let run = exec.run(&action, &context()).await;
        let output = run.outcome.unwrap();
        assert_eq!(output.result["target"], "lead_1");
        assert_eq!(run.attempts, 1);
    }

    #[tokio::test]
    async fn unknown_hub_is_a_routing_error() {
        let exec = ActionExecutor::new(Arc::new(HubRegistry::new()));
        let action = Action::new("a", HubId::ops_optimization(), "noop", "x");
        let run = exec.run(&action, &context()).await;
        assert!(matches!(run.outcome, Err(ActionError::Routing { .. })));
        assert_eq!(run.attempts, 0);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let exec = executor_with(
            HubId::executive(),
            FnHandler::new(move |_a, _c| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::transient("flaky"))
                }
            }),
        );
        let action = Action::new("a", HubId::executive(), "noop", "x")
            .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)));
        let run = exec.run(&action, &context()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.attempts, 3);
        assert_eq!(run.attempt_errors.len(), 3);
        let err = run.outcome.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let exec = executor_with(
            HubId::executive(),
            FnHandler::new(|_a, _c| async { Err(HandlerError::permanent("bad input")) }),
        );
        let action = Action::new("a", HubId::executive(), "noop", "x");
        let run = exec.run(&action, &context()).await;
        let err = run.outcome.unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(run.attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let exec = executor_with(
            HubId::executive(),
            FnHandler::new(move |_a, _c| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(HandlerError::transient("first call fails"))
                    } else {
                        Ok(ActionOutput::default())
                    }
                }
            }),
        );
        let action = Action::new("a", HubId::executive(), "noop", "x")
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)));
        let run = exec.run(&action, &context()).await;
        assert!(run.outcome.is_ok());
        assert_eq!(run.attempts, 2);
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let exec = executor_with(
            HubId::executive(),
            FnHandler::new(|_a, _c| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(ActionOutput::default())
            }),
        );
        let action = Action::new("a", HubId::executive(), "noop", "x")
            .with_timeout(Duration::from_millis(10))
            .with_retry(RetryPolicy::no_retry());
        let run = exec.run(&action, &context()).await;
        assert!(matches!(
            run.outcome,
            Err(ActionError::Timeout { attempts: 1, exhausted: true, .. })
        ));
    }

    #[tokio::test]
    async fn compensation_uses_registered_closure() {
        let undone = Arc::new(AtomicU32::new(0));
        let flag = undone.clone();
        let exec = executor_with(
            HubId::executive(),
            FnHandler::new(|_a, _c| async { Ok(ActionOutput::default()) }).on_compensate(
                move |_a, _c| {
                    let flag = flag.clone();
                    async move {
                        flag.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            ),
        );
        let action = Action::new("a", HubId::executive(), "noop", "x");
        exec.compensate(&action, &context()).await.unwrap();
        assert_eq!(undone.load(Ordering::SeqCst), 1);
    }
}
