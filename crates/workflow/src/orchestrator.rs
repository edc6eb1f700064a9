//! Top-level workflow API.
//!
//! The orchestrator owns the registry of workflows it created. Execution
//! takes a snapshot out of the registry, runs it through the scheduler and
//! writes the final state back, so the registry lock is never held across an
//! action.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use hubflow_core::WorkflowId;
use hubflow_events::keys::workflow_key;
use hubflow_events::{
    Broker, ChangeSink, Notification, NotificationKind, SweeperHandle, publish_notification,
    stage_json,
};

use crate::analytics::{AnalyticsStore, ExecutionRecord, WorkflowAnalytics};
use crate::error::WorkflowError;
use crate::executor::{ActionExecutor, HubRegistry};
use crate::graph;
use crate::model::{
    Action, ActionStatus, LogEvent, UnifiedWorkflow, WorkflowContext, WorkflowOptions,
    WorkflowStatus,
};
use crate::scheduler::{CancelToken, ExecutionReport, SchedulerConfig, WorkflowScheduler};
use crate::templates::TemplateLibrary;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    /// Terminal workflows older than this are evicted by `sweep`.
    pub registry_ttl: Duration,
    /// TTL of workflow snapshots staged in the broker.
    pub staging_ttl: Duration,
    pub analytics_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            registry_ttl: Duration::from_secs(3600),
            staging_ttl: Duration::from_secs(3600),
            analytics_capacity: 10_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_registry_ttl(mut self, ttl: Duration) -> Self {
        self.registry_ttl = ttl;
        self
    }

    pub fn with_staging_ttl(mut self, ttl: Duration) -> Self {
        self.staging_ttl = ttl;
        self
    }
}

struct Slot {
    workflow: UnifiedWorkflow,
    cancel: CancelToken,
}

pub struct WorkflowOrchestrator {
    scheduler: WorkflowScheduler,
    broker: Arc<dyn Broker>,
    sink: Option<Arc<dyn ChangeSink>>,
    templates: TemplateLibrary,
    workflows: RwLock<HashMap<WorkflowId, Slot>>,
    analytics: Mutex<AnalyticsStore>,
    config: OrchestratorConfig,
}

impl WorkflowOrchestrator {
    pub fn new(registry: HubRegistry, broker: Arc<dyn Broker>, config: OrchestratorConfig) -> Self {
        let executor = ActionExecutor::new(Arc::new(registry));
        Self {
            scheduler: WorkflowScheduler::new(executor, config.scheduler.clone()),
            broker,
            sink: None,
            templates: TemplateLibrary::standard(),
            workflows: RwLock::new(HashMap::new()),
            analytics: Mutex::new(AnalyticsStore::with_capacity(config.analytics_capacity)),
            config,
        }
    }

    /// Forward action-emitted change events to `sink` after each execution.
    pub fn with_change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_templates(mut self, templates: TemplateLibrary) -> Self {
        self.templates = templates;
        self
    }

    pub fn templates(&self) -> &TemplateLibrary {
        &self.templates
    }

    /// Validate and register a new workflow in `Pending`.
    ///
    /// Structural errors (cycles, unknown or duplicate ids) are returned here
    /// and nothing is stored.
    #[instrument(skip(self, description, actions, context, options))]
    pub async fn create_workflow(
        &self,
        name: &str,
        description: &str,
        actions: Vec<Action>,
        context: WorkflowContext,
        options: WorkflowOptions,
    ) -> Result<UnifiedWorkflow, WorkflowError> {
        graph::validate(&actions)?;

        let actions = actions.iter().map(Action::reset).collect();
        let mut workflow = UnifiedWorkflow::new(name, description, actions, context, options);
        workflow.log(LogEvent::WorkflowCreated, None, None);

        self.workflows.write().await.insert(
            workflow.id,
            Slot {
                workflow: workflow.clone(),
                cancel: CancelToken::new(),
            },
        );
        info!(workflow_id = %workflow.id, actions = workflow.actions.len(), "workflow created");
        Ok(workflow)
    }

    pub async fn create_from_template(
        &self,
        template_id: &str,
        name: &str,
        context: WorkflowContext,
        options: WorkflowOptions,
    ) -> Result<UnifiedWorkflow, WorkflowError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| WorkflowError::TemplateNotFound(template_id.to_string()))?;
        let actions = template.instantiate(&context);
        let description = template.description.clone();
        self.create_workflow(name, &description, actions, context, options)
            .await
    }

    /// Run a pending workflow to a terminal status.
    ///
    /// Only lookup and lifecycle errors are returned as `Err`; everything
    /// that happens during execution is in the report.
    #[instrument(skip(self))]
    pub async fn execute_workflow(&self, id: WorkflowId) -> Result<ExecutionReport, WorkflowError> {
        let (mut workflow, cancel) = {
            let mut workflows = self.workflows.write().await;
            let slot = workflows.get_mut(&id).ok_or(WorkflowError::NotFound(id))?;
            if slot.workflow.status != WorkflowStatus::Pending {
                return Err(WorkflowError::InvalidTransition {
                    id,
                    from: slot.workflow.status,
                    operation: "execute",
                });
            }
            slot.workflow.status = WorkflowStatus::Executing;
            (slot.workflow.clone(), slot.cancel.clone())
        };

        let mut broker_errors = Vec::new();
        self.stage(&workflow, &mut broker_errors).await;

        let mut report = self.scheduler.execute(&mut workflow, &cancel).await;

        if let Some(sink) = &self.sink {
            for event in &report.change_events {
                let outcome = sink.submit(event.clone()).await;
                debug!(event_id = %outcome.event_id, status = %outcome.status, "change event forwarded");
                report.forwarded.push(outcome);
            }
        }

        self.stage(&workflow, &mut broker_errors).await;
        self.notify(&workflow, &report, &mut broker_errors).await;
        report.broker_errors = broker_errors;

        self.analytics.lock().await.record(ExecutionRecord::from(&report));
        if let Some(slot) = self.workflows.write().await.get_mut(&id) {
            slot.workflow = workflow;
        }

        Ok(report)
    }

    /// Cancel a pending or executing workflow.
    ///
    /// Pending workflows are cancelled immediately. Executing ones stop
    /// dispatching; in-flight actions finish or time out on their own.
    pub async fn cancel_workflow(&self, id: WorkflowId) -> Result<WorkflowStatus, WorkflowError> {
        let mut workflows = self.workflows.write().await;
        let slot = workflows.get_mut(&id).ok_or(WorkflowError::NotFound(id))?;
        match slot.workflow.status {
            WorkflowStatus::Pending => {
                slot.cancel.cancel();
                let wf = &mut slot.workflow;
                for action in &mut wf.actions {
                    action.status = ActionStatus::Cancelled;
                }
                wf.status = WorkflowStatus::Cancelled;
                wf.context.completed_at = Some(Utc::now());
                wf.log(LogEvent::WorkflowCancelled, None, Some("cancelled before start".into()));
                info!(workflow_id = %id, "pending workflow cancelled");
                Ok(WorkflowStatus::Cancelled)
            }
            WorkflowStatus::Executing => {
                slot.cancel.cancel();
                info!(workflow_id = %id, "cancellation requested for executing workflow");
                Ok(WorkflowStatus::Executing)
            }
            from => Err(WorkflowError::InvalidTransition {
                id,
                from,
                operation: "cancel",
            }),
        }
    }

    pub async fn get_workflow(&self, id: WorkflowId) -> Option<UnifiedWorkflow> {
        self.workflows
            .read()
            .await
            .get(&id)
            .map(|slot| slot.workflow.clone())
    }

    /// Workflows, oldest first, optionally filtered by status.
    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Vec<UnifiedWorkflow> {
        let mut out: Vec<UnifiedWorkflow> = self
            .workflows
            .read()
            .await
            .values()
            .filter(|slot| status.is_none_or(|s| slot.workflow.status == s))
            .map(|slot| slot.workflow.clone())
            .collect();
        out.sort_by_key(|w| w.created_at);
        out
    }

    pub async fn get_analytics(&self) -> WorkflowAnalytics {
        self.analytics.lock().await.summarize(Utc::now())
    }

    /// Evict terminal workflows that finished more than `registry_ttl` ago.
    ///
    /// Pending and executing workflows are never evicted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.config.registry_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut workflows = self.workflows.write().await;
        let before = workflows.len();
        workflows.retain(|_, slot| {
            let wf = &slot.workflow;
            if !wf.status.is_terminal() {
                return true;
            }
            let finished = wf.context.completed_at.unwrap_or(wf.created_at);
            now - finished < ttl
        });
        let evicted = before - workflows.len();
        if evicted > 0 {
            debug!(evicted, remaining = workflows.len(), "workflow registry swept");
        }
        evicted
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let orchestrator = Arc::clone(self);
        SweeperHandle::spawn("workflow-registry", interval, move || {
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator.sweep(Utc::now()).await;
            }
        })
    }

    async fn stage(&self, workflow: &UnifiedWorkflow, errors: &mut Vec<String>) {
        let key = workflow_key(workflow.id);
        if let Err(e) = stage_json(self.broker.as_ref(), &key, workflow, self.config.staging_ttl).await {
            warn!(workflow_id = %workflow.id, error = %e, "failed to stage workflow");
            errors.push(format!("stage {key}: {e}"));
        }
    }

    async fn notify(
        &self,
        workflow: &UnifiedWorkflow,
        report: &ExecutionReport,
        errors: &mut Vec<String>,
    ) {
        let (kind, title) = match report.status {
            WorkflowStatus::Completed => (NotificationKind::WorkflowCompleted, "Workflow completed"),
            WorkflowStatus::Failed => (NotificationKind::WorkflowFailed, "Workflow failed"),
            _ => return,
        };
        let message = format!(
            "{}: {}/{} actions completed in {} ms",
            workflow.name,
            report.completed,
            workflow.actions.len(),
            report.elapsed_ms
        );
        let notification = Notification::new(
            kind,
            workflow.context.primary_hub.clone(),
            title,
            message,
        )
        .to_hubs([workflow.context.primary_hub.clone()])
        .with_priority(workflow.context.priority);

        if let Err(e) = publish_notification(self.broker.as_ref(), &notification).await {
            warn!(workflow_id = %workflow.id, error = %e, "failed to publish completion notification");
            errors.push(format!("notify: {e}"));
        }
    }
}
