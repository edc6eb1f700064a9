use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;

use hubflow_core::{ChangeEvent, ConflictStrategy, EntityType, HubId};
use hubflow_events::InMemoryBroker;
use hubflow_sync::{
    ConflictResolver, DataSynchronizer, DataValidator, HubCacheSet, HubRouter, SyncConfiguration,
    SyncStatus, SynchronizerConfig,
};
use hubflow_workflow::{
    Action, ActionOutput, ActionStatus, FnHandler, HandlerError, HubRegistry, OrchestratorConfig,
    RetryPolicy, WorkflowContext, WorkflowError, WorkflowOptions, WorkflowOrchestrator,
    WorkflowStatus,
};

fn context() -> WorkflowContext {
    WorkflowContext::new("user_1", "session_1", HubId::executive())
}

fn noop_registry() -> HubRegistry {
    HubRegistry::new().with(
        HubId::executive(),
        FnHandler::new(|action: Action, _ctx: WorkflowContext| async move {
            Ok(ActionOutput::new(json!({ "done": action.id.as_str() })))
        }),
    )
}

fn orchestrator(registry: HubRegistry) -> WorkflowOrchestrator {
    WorkflowOrchestrator::new(
        registry,
        Arc::new(InMemoryBroker::new()),
        OrchestratorConfig::default(),
    )
}

fn synchronizer(configs: Vec<SyncConfiguration>, caches: Arc<HubCacheSet>) -> DataSynchronizer {
    DataSynchronizer::new(
        DataValidator::standard(),
        ConflictResolver::standard(),
        HubRouter::new(configs),
        caches,
        Arc::new(InMemoryBroker::new()),
        SynchronizerConfig::default(),
    )
}

#[tokio::test]
async fn scenario_a_independent_noops_complete() {
    let orch = orchestrator(noop_registry());
    let actions = ["one", "two", "three"]
        .map(|id| Action::new(id, HubId::executive(), "noop", "none"))
        .to_vec();
    let wf = orch
        .create_workflow("noops", "three independent actions", actions, context(), WorkflowOptions::default())
        .await
        .unwrap();

    let report = orch.execute_workflow(wf.id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.success_rate, 1.0);
    assert_eq!(report.completed, 3);
}

#[tokio::test]
async fn scenario_b_failed_dependency_rolls_back() {
    let started = Arc::new(Mutex::new(Vec::<String>::new()));
    let compensated = Arc::new(Mutex::new(Vec::<String>::new()));

    let started_log = started.clone();
    let compensated_log = compensated.clone();
    let handler = FnHandler::new(move |action: Action, _ctx: WorkflowContext| {
        let started = started_log.clone();
        async move {
            started.lock().unwrap().push(action.id.as_str().to_string());
            if action.id.as_str() == "action1" {
                Err(HandlerError::permanent("lead service rejected the request"))
            } else {
                Ok(ActionOutput::new(json!({})))
            }
        }
    })
    .on_compensate(move |action: Action, _ctx: WorkflowContext| {
        let compensated = compensated_log.clone();
        async move {
            compensated.lock().unwrap().push(action.id.as_str().to_string());
            Ok::<(), HandlerError>(())
        }
    });

    let orch = orchestrator(HubRegistry::new().with(HubId::lead_intelligence(), handler));
    let actions = vec![
        Action::new("action1", HubId::lead_intelligence(), "score_lead", "lead_42")
            .with_retry(RetryPolicy::no_retry()),
        Action::new("action2", HubId::lead_intelligence(), "route_lead", "lead_42").after("action1"),
    ];
    let wf = orch
        .create_workflow("qualify", "", actions, context(), WorkflowOptions::default().with_rollback(true))
        .await
        .unwrap();

    let report = orch.execute_workflow(wf.id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(*started.lock().unwrap(), vec!["action1".to_string()]);
    assert!(report.action("action2").unwrap().started_at.is_none());
    assert_ne!(report.action("action2").unwrap().status, ActionStatus::Completed);
    assert_eq!(*compensated.lock().unwrap(), vec!["action1".to_string()]);
    assert!(report.rollback.is_some());
}

#[tokio::test]
async fn cyclic_workflow_is_never_stored() {
    let orch = orchestrator(noop_registry());
    let actions = vec![
        Action::new("a", HubId::executive(), "noop", "x").after("c"),
        Action::new("b", HubId::executive(), "noop", "x").after("a"),
        Action::new("c", HubId::executive(), "noop", "x").after("b"),
    ];
    let err = orch
        .create_workflow("loop", "", actions, context(), WorkflowOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::CyclicDependency { .. }));
    assert!(orch.list_workflows(None).await.is_empty());
}

#[tokio::test]
async fn independent_actions_run_in_parallel() {
    let registry = HubRegistry::new().with(
        HubId::executive(),
        FnHandler::new(|_action: Action, _ctx: WorkflowContext| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ActionOutput::new(json!({})))
        }),
    );
    let orch = orchestrator(registry);
    let actions = (0..5)
        .map(|i| Action::new(format!("slow_{i}"), HubId::executive(), "sleep", "none"))
        .collect();
    let wf = orch
        .create_workflow("parallel", "", actions, context(), WorkflowOptions::default())
        .await
        .unwrap();

    let clock = Instant::now();
    let report = orch.execute_workflow(wf.id).await.unwrap();
    let elapsed = clock.elapsed();

    assert_eq!(report.status, WorkflowStatus::Completed);
    // Sequential would take ~1000 ms.
    assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
}

#[test]
fn scenario_c_later_write_wins() {
    let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
    let t2 = t1 + ChronoDuration::seconds(30);
    let first = ChangeEvent::update(HubId::lead_intelligence(), EntityType::Lead, "lead_42", "u1")
        .at(t1)
        .set("status", json!("contacted"));
    let second = ChangeEvent::update(HubId::sales_copilot(), EntityType::Lead, "lead_42", "u2")
        .at(t2)
        .set("status", json!("qualified"));

    let resolver = ConflictResolver::default();
    let winner = resolver
        .resolve(&[first.clone(), second.clone()], ConflictStrategy::LastWriteWins)
        .unwrap();
    assert_eq!(winner.id, second.id);
    let winner = resolver
        .resolve(&[second.clone(), first], ConflictStrategy::LastWriteWins)
        .unwrap();
    assert_eq!(winner.id, second.id);
}

#[tokio::test]
async fn scenario_d_invalid_email_is_rejected() {
    let caches = Arc::new(HubCacheSet::standard());
    let sync = synchronizer(hubflow_sync::default_topology(), caches.clone());
    let event = ChangeEvent::update(HubId::lead_intelligence(), EntityType::Lead, "lead_42", "u")
        .set("email", json!("not-an-email"));

    let report = sync.sync_change(event.clone()).await;
    assert_eq!(report.status, SyncStatus::ValidationFailed);
    assert_eq!(report.status.as_str(), "validation_failed");
    assert!(report.hub_results.is_empty());
    for hub in caches.hubs() {
        assert!(caches.get(&hub).unwrap().entry(&event.key()).is_none());
    }
}

#[tokio::test]
async fn scenario_e_configured_targets_receive_exactly_the_change() {
    let hub_a: HubId = "hub_a".parse().unwrap();
    let hub_b: HubId = "hub_b".parse().unwrap();
    let bystander: HubId = "hub_c".parse().unwrap();
    let caches = Arc::new(HubCacheSet::new([
        HubId::lead_intelligence(),
        hub_a.clone(),
        hub_b.clone(),
        bystander.clone(),
    ]));
    let config = SyncConfiguration::new(
        HubId::lead_intelligence(),
        [hub_a.clone(), hub_b.clone()],
        [EntityType::Lead],
    );
    let sync = synchronizer(vec![config], caches.clone());

    let event = ChangeEvent::update(HubId::lead_intelligence(), EntityType::Lead, "lead_42", "u")
        .set("lead_score", json!(72));
    let report = sync.sync_change(event.clone()).await;

    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.targets, vec![hub_a.clone(), hub_b.clone()]);
    for hub in [&hub_a, &hub_b] {
        let entry = caches.get(hub).unwrap().entry(&event.key()).unwrap();
        assert_eq!(entry.field("lead_score"), Some(&json!(72)));
    }
    assert!(caches.get(&bystander).unwrap().entry(&event.key()).is_none());
    assert!(caches.get(&HubId::lead_intelligence()).unwrap().entry(&event.key()).is_none());
}
