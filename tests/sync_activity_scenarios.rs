//! End-to-end passive replication scenarios
//!
//! Each test drives a full engine (shard context, execution cache, memory
//! store) through one remote-cluster interaction and checks both the
//! visible outcome and the absence of writes where a no-op is required.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;

use weir::config::EngineConfig;
use weir::engine::HistoryEngine;
use weir::error::EngineError;
use weir::execution::{CloseStatus, DomainId, RunId, WorkflowId, WorkflowState};
use weir::history::{VersionHistories, VersionHistory, VersionHistoryItem};
use weir::persistence::memory::MemoryStore;
use weir::persistence::{
    CreateWorkflowMode, CreateWorkflowRequest, ExecutionStore, HistoryStore, ShardStore,
    TaskBatch, WorkflowExecutionRecord,
};
use weir::replication::SyncActivityRequest;
use weir::shard::{shard_for, ShardContext};
use weir::state::info::{ActivityInfo, ExecutionInfo};

const SHARD_COUNT: i32 = 8;

struct Cluster {
    engine: Arc<HistoryEngine>,
    store: Arc<MemoryStore>,
    shard_id: i32,
}

async fn cluster_for(workflow_id: &WorkflowId) -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let shard_id = shard_for(workflow_id, SHARD_COUNT);
    let shard = ShardContext::acquire(
        store.clone() as Arc<dyn ShardStore>,
        store.clone() as Arc<dyn ExecutionStore>,
        shard_id,
        "standby-host",
    )
    .await
    .unwrap();
    let config = EngineConfig {
        shard_count: SHARD_COUNT,
        ..EngineConfig::default()
    };
    let engine = HistoryEngine::new(shard, store.clone() as Arc<dyn HistoryStore>, config)
        .unwrap();
    Cluster {
        engine,
        store,
        shard_id,
    }
}

/// Directly seed a run record with a given branch shape and activity set
async fn seed_run(
    cluster: &Cluster,
    domain_id: &DomainId,
    workflow_id: &WorkflowId,
    run_id: &RunId,
    branch_items: &[(i64, i64)],
    activities: &[(i64, i64, i32)],
    state: WorkflowState,
) {
    let items: Vec<VersionHistoryItem> = branch_items
        .iter()
        .map(|&(event_id, version)| VersionHistoryItem::new(event_id, version))
        .collect();
    let tip = *items.last().expect("branch must have a tip");
    let history = VersionHistory::new(b"seeded-branch".to_vec(), items).unwrap();

    let mut execution_info = ExecutionInfo::new(
        domain_id.clone(),
        workflow_id.clone(),
        run_id.clone(),
        "tl".into(),
    );
    execution_info.state = state;
    execution_info.next_event_id = tip.event_id + 1;
    execution_info.last_first_event_id = tip.event_id;

    let mut activity_infos = HashMap::new();
    for &(schedule_id, version, attempt) in activities {
        let mut activity = ActivityInfo::new(schedule_id, version, format!("act-{schedule_id}"));
        activity.attempt = attempt;
        activity_infos.insert(schedule_id, activity);
    }

    let record = WorkflowExecutionRecord {
        execution_info,
        activity_infos,
        timer_infos: HashMap::new(),
        child_executions: HashMap::new(),
        signal_requested_ids: Vec::new(),
        buffered_events: Vec::new(),
        version_histories: Some(VersionHistories::new(history)),
        current_version: tip.version,
        last_write_version: tip.version,
        record_version: 0,
    };
    cluster
        .store
        .create_workflow_execution(CreateWorkflowRequest {
            shard_id: cluster.shard_id,
            range_id: cluster.engine.shard().range_id(),
            mode: CreateWorkflowMode::UpdateCurrent,
            record,
            tasks: TaskBatch::default(),
        })
        .await
        .unwrap();
}

fn sync_request(
    workflow_id: &WorkflowId,
    run_id: &str,
    version: i64,
    scheduled_id: i64,
    history: &[(i64, i64)],
) -> SyncActivityRequest {
    SyncActivityRequest {
        domain_id: "dom".into(),
        workflow_id: workflow_id.clone(),
        run_id: run_id.into(),
        version,
        scheduled_id,
        scheduled_time: Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        started_id: 0,
        started_time: None,
        attempt: 0,
        last_heartbeat_time: Some(Utc.with_ymd_and_hms(2024, 6, 1, 8, 5, 0).unwrap()),
        details: json!({"progress": 42}),
        version_history: Some(
            history
                .iter()
                .map(|&(event_id, version)| VersionHistoryItem::new(event_id, version))
                .collect(),
        ),
    }
}

async fn dump_executions(cluster: &Cluster, run_id: &str) -> Option<WorkflowExecutionRecord> {
    cluster
        .store
        .get_workflow_execution(
            cluster.shard_id,
            &"dom".into(),
            &"wf".into(),
            &run_id.into(),
        )
        .await
        .ok()
}

// Scenario 1: the run was already deleted by retention.
#[tokio::test]
async fn sync_activity_against_missing_workflow_is_a_noop() {
    let workflow_id: WorkflowId = "wf".into();
    let cluster = cluster_for(&workflow_id).await;

    let request = sync_request(&workflow_id, "run-gone", 100, 144, &[(144, 100)]);
    cluster.engine.sync_activity(request).await.unwrap();

    assert!(dump_executions(&cluster, "run-gone").await.is_none());
}

// Scenario 2: a closed run accepts nothing but stays untouched.
#[tokio::test]
async fn sync_activity_against_closed_workflow_is_a_noop() {
    let workflow_id: WorkflowId = "wf".into();
    let cluster = cluster_for(&workflow_id).await;
    seed_run(
        &cluster,
        &"dom".into(),
        &workflow_id,
        &"run-1".into(),
        &[(1, 1), (145, 100)],
        &[],
        WorkflowState::Closed(CloseStatus::Completed),
    )
    .await;
    let before = dump_executions(&cluster, "run-1").await.unwrap();

    let request = sync_request(&workflow_id, "run-1", 100, 144, &[(1, 1), (144, 100)]);
    cluster.engine.sync_activity(request).await.unwrap();

    let after = dump_executions(&cluster, "run-1").await.unwrap();
    assert_eq!(before, after);
}

// Scenario 3: the incoming lineage lost a failover; discard silently.
#[tokio::test]
async fn dominated_incoming_history_is_discarded() {
    let workflow_id: WorkflowId = "wf".into();
    let cluster = cluster_for(&workflow_id).await;
    seed_run(
        &cluster,
        &"dom".into(),
        &workflow_id,
        &"run-1".into(),
        &[(1, 1), (145, 100)],
        &[(144, 100, 0)],
        WorkflowState::Running,
    )
    .await;
    let before = dump_executions(&cluster, "run-1").await.unwrap();

    let request = sync_request(&workflow_id, "run-1", 99, 144, &[(1, 1), (144, 99)]);
    cluster.engine.sync_activity(request).await.unwrap();

    let after = dump_executions(&cluster, "run-1").await.unwrap();
    assert_eq!(before, after);
}

// Scenario 4: same lineage, remote is ahead; ask for events from our tip.
#[tokio::test]
async fn incoming_ahead_on_current_branch_returns_retry() {
    let workflow_id: WorkflowId = "wf".into();
    let cluster = cluster_for(&workflow_id).await;
    seed_run(
        &cluster,
        &"dom".into(),
        &workflow_id,
        &"run-1".into(),
        &[(130, 100)],
        &[],
        WorkflowState::Running,
    )
    .await;

    let request = sync_request(&workflow_id, "run-1", 100, 144, &[(144, 100)]);
    let err = cluster.engine.sync_activity(request).await.unwrap_err();
    match err {
        EngineError::RetryTask {
            start_event_id,
            start_event_version,
            ..
        } => {
            assert_eq!(start_event_id, Some(130));
            assert_eq!(start_event_version, Some(100));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// Scenario 5: branches diverged at (50, 2); resend from the divergence.
#[tokio::test]
async fn cross_branch_conflict_returns_retry_from_lca() {
    let workflow_id: WorkflowId = "wf".into();
    let cluster = cluster_for(&workflow_id).await;
    seed_run(
        &cluster,
        &"dom".into(),
        &workflow_id,
        &"run-1".into(),
        &[(100, 2)],
        &[],
        WorkflowState::Running,
    )
    .await;

    let request = sync_request(&workflow_id, "run-1", 100, 144, &[(50, 2), (144, 100)]);
    let err = cluster.engine.sync_activity(request).await.unwrap_err();
    match err {
        EngineError::RetryTask {
            start_event_id,
            start_event_version,
            ..
        } => {
            assert_eq!(start_event_id, Some(50));
            assert_eq!(start_event_version, Some(2));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// Scenario 6: a fresh heartbeat for a known activity is persisted, with a
// retry timer task alongside.
#[tokio::test]
async fn heartbeat_update_is_accepted_and_persisted() {
    let workflow_id: WorkflowId = "wf".into();
    let cluster = cluster_for(&workflow_id).await;
    seed_run(
        &cluster,
        &"dom".into(),
        &workflow_id,
        &"run-1".into(),
        &[(1, 1), (145, 100)],
        &[(144, 100, 0)],
        WorkflowState::Running,
    )
    .await;

    let request = sync_request(&workflow_id, "run-1", 100, 144, &[(1, 1), (145, 100)]);
    cluster.engine.sync_activity(request.clone()).await.unwrap();

    let record = dump_executions(&cluster, "run-1").await.unwrap();
    let activity = record.activity_infos.get(&144).unwrap();
    assert_eq!(activity.last_heartbeat_time, request.last_heartbeat_time);
    assert_eq!(activity.details, json!({"progress": 42}));

    let timers = cluster
        .store
        .get_timer_tasks(cluster.shard_id, Utc::now() + chrono::Duration::days(365), 10)
        .await
        .unwrap();
    assert_eq!(timers.len(), 1, "expected one activity retry timer");
}

// Replaying an applied update leaves the record bitwise-identical.
#[tokio::test]
async fn replayed_sync_activity_is_idempotent() {
    let workflow_id: WorkflowId = "wf".into();
    let cluster = cluster_for(&workflow_id).await;
    seed_run(
        &cluster,
        &"dom".into(),
        &workflow_id,
        &"run-1".into(),
        &[(1, 1), (145, 100)],
        &[(144, 100, 0)],
        WorkflowState::Running,
    )
    .await;

    let request = sync_request(&workflow_id, "run-1", 100, 144, &[(1, 1), (145, 100)]);
    cluster.engine.sync_activity(request.clone()).await.unwrap();
    let first = dump_executions(&cluster, "run-1").await.unwrap();

    cluster.engine.sync_activity(request).await.unwrap();
    let second = dump_executions(&cluster, "run-1").await.unwrap();
    assert_eq!(first, second);
}

// Activity (version, attempt) never goes backwards, whatever the delivery
// order.
#[tokio::test]
async fn activity_newness_is_monotonic_under_reordering() {
    let workflow_id: WorkflowId = "wf".into();
    let cluster = cluster_for(&workflow_id).await;
    seed_run(
        &cluster,
        &"dom".into(),
        &workflow_id,
        &"run-1".into(),
        &[(1, 1), (145, 100)],
        &[(144, 100, 0)],
        WorkflowState::Running,
    )
    .await;

    let deliveries: Vec<(i64, i32)> =
        vec![(100, 2), (100, 1), (100, 5), (100, 3), (100, 5), (100, 4)];
    let mut observed = Vec::new();
    for (version, attempt) in deliveries {
        let mut request =
            sync_request(&workflow_id, "run-1", version, 144, &[(1, 1), (145, 100)]);
        request.attempt = attempt;
        cluster.engine.sync_activity(request).await.unwrap();
        let record = dump_executions(&cluster, "run-1").await.unwrap();
        let activity = record.activity_infos.get(&144).unwrap();
        observed.push((activity.version, activity.attempt));
    }
    for pair in observed.windows(2) {
        assert!(pair[1] >= pair[0], "newness regressed: {pair:?}");
    }
    assert_eq!(observed.last().unwrap(), &(100, 5));
}

// Fencing: once the shard is re-leased, the old engine's writes never land.
#[tokio::test]
async fn stale_shard_owner_cannot_apply_updates() {
    let workflow_id: WorkflowId = "wf".into();
    let cluster = cluster_for(&workflow_id).await;
    seed_run(
        &cluster,
        &"dom".into(),
        &workflow_id,
        &"run-1".into(),
        &[(1, 1), (145, 100)],
        &[(144, 100, 0)],
        WorkflowState::Running,
    )
    .await;

    // Another host takes the shard lease out from under the engine.
    let _new_owner = ShardContext::acquire(
        cluster.store.clone() as Arc<dyn ShardStore>,
        cluster.store.clone() as Arc<dyn ExecutionStore>,
        cluster.shard_id,
        "thief-host",
    )
    .await
    .unwrap();
    let before = dump_executions(&cluster, "run-1").await.unwrap();

    let mut request = sync_request(&workflow_id, "run-1", 100, 144, &[(1, 1), (145, 100)]);
    request.attempt = 7;
    let err = cluster.engine.sync_activity(request).await.unwrap_err();
    assert!(matches!(err, EngineError::ShardOwnershipLost { .. }));
    assert!(cluster.engine.shard().is_lost());

    let after = dump_executions(&cluster, "run-1").await.unwrap();
    assert_eq!(before, after, "fenced write must not land");
}
