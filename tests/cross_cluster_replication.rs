//! Active-to-standby replication round trip
//!
//! Drives two single-shard clusters: the active one starts a workflow and
//! produces replication tasks; the standby drains them through the same
//! message-reader interface a real peer would poll, applies the event
//! batches, and then reconciles an activity heartbeat.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use weir::config::EngineConfig;
use weir::engine::{HistoryEngine, StartWorkflowRequest};
use weir::execution::{EventType, WorkflowId};
use weir::history::VersionHistoryItem;
use weir::persistence::memory::MemoryStore;
use weir::persistence::{ExecutionStore, HistoryStore, ShardStore};
use weir::replication::{ReplicateEventsRequest, SyncActivityRequest};
use weir::shard::{shard_for, ShardContext};
use weir::tasks::ReplicationTask;

const SHARD_COUNT: i32 = 8;

struct Cluster {
    engine: Arc<HistoryEngine>,
    store: Arc<MemoryStore>,
}

async fn cluster(workflow_id: &WorkflowId, name: &str) -> Cluster {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("weir=debug")
        .with_test_writer()
        .try_init();
    let store = Arc::new(MemoryStore::new());
    let shard = ShardContext::acquire(
        store.clone() as Arc<dyn ShardStore>,
        store.clone() as Arc<dyn ExecutionStore>,
        shard_for(workflow_id, SHARD_COUNT),
        format!("{name}-host"),
    )
    .await
    .unwrap();
    let config = EngineConfig {
        shard_count: SHARD_COUNT,
        cluster_name: name.to_string(),
        ..EngineConfig::default()
    };
    let engine = HistoryEngine::new(shard, store.clone() as Arc<dyn HistoryStore>, config)
        .unwrap();
    Cluster { engine, store }
}

/// Ship every queued history batch from `active` to `standby`, the way a
/// polling peer would.
async fn ship_replication_tasks(active: &Cluster, standby: &Cluster) {
    let shard_id = active.engine.shard().shard_id();
    let messages = active
        .engine
        .get_replication_messages("standby".to_string(), 0)
        .await
        .unwrap();
    for task in messages.tasks {
        let ReplicationTask::History {
            domain_id,
            workflow_id,
            run_id,
            first_event_id,
            next_event_id,
            branch_token,
            ..
        } = task.task
        else {
            continue;
        };
        let events = active
            .store
            .read_branch(&branch_token, first_event_id, next_event_id)
            .await
            .unwrap();
        let record = active
            .store
            .get_workflow_execution(shard_id, &domain_id, &workflow_id, &run_id)
            .await
            .unwrap();
        let items: Vec<VersionHistoryItem> = record
            .version_histories
            .as_ref()
            .unwrap()
            .current()
            .items()
            .to_vec();
        standby
            .engine
            .replicate_events(ReplicateEventsRequest {
                domain_id,
                workflow_id,
                run_id,
                version_history_items: items,
                events,
                new_run_events: None,
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn standby_converges_on_active_history() {
    let workflow_id: WorkflowId = "payment-flow".into();
    let active = cluster(&workflow_id, "active").await;
    let standby = cluster(&workflow_id, "standby").await;

    let run_id = active
        .engine
        .start_workflow_execution(StartWorkflowRequest {
            domain_id: "dom".into(),
            workflow_id: workflow_id.clone(),
            task_list: "payments".into(),
            failover_version: 1,
        })
        .await
        .unwrap();

    ship_replication_tasks(&active, &standby).await;

    let shard_id = active.engine.shard().shard_id();
    let active_record = active
        .store
        .get_workflow_execution(shard_id, &"dom".into(), &workflow_id, &run_id)
        .await
        .unwrap();
    let standby_record = standby
        .store
        .get_workflow_execution(shard_id, &"dom".into(), &workflow_id, &run_id)
        .await
        .unwrap();

    assert_eq!(
        standby_record.execution_info.next_event_id,
        active_record.execution_info.next_event_id
    );
    assert_eq!(
        standby_record.version_histories.as_ref().unwrap().current().items(),
        active_record.version_histories.as_ref().unwrap().current().items()
    );
    // The standby produced no outbound replication of its own.
    let standby_queue = standby
        .store
        .get_replication_tasks(shard_id, 0, 10)
        .await
        .unwrap();
    assert!(standby_queue.is_empty());
}

#[tokio::test]
async fn replicated_activity_heartbeat_lands_on_standby() {
    let workflow_id: WorkflowId = "payment-flow".into();
    let active = cluster(&workflow_id, "active").await;
    let standby = cluster(&workflow_id, "standby").await;
    let shard_id = active.engine.shard().shard_id();

    let run_id = active
        .engine
        .start_workflow_execution(StartWorkflowRequest {
            domain_id: "dom".into(),
            workflow_id: workflow_id.clone(),
            task_list: "payments".into(),
            failover_version: 1,
        })
        .await
        .unwrap();

    // The active side schedules an activity through its own state machine.
    {
        let record = active
            .store
            .get_workflow_execution(shard_id, &"dom".into(), &workflow_id, &run_id)
            .await
            .unwrap();
        let mut state = weir::state::MutableState::from_record(record).unwrap();
        state
            .apply_events(vec![
                (EventType::DecisionTaskStarted, json!({})),
                (EventType::DecisionTaskCompleted, json!({})),
                (
                    EventType::ActivityTaskScheduled,
                    json!({"activity_id": "charge", "task_list": "payments"}),
                ),
            ])
            .unwrap();
        let transaction = state.close_transaction_as_active().unwrap();
        active
            .store
            .append_events(&transaction.branch_token, transaction.new_events.clone())
            .await
            .unwrap();
        active
            .engine
            .shard()
            .update_workflow_execution(weir::persistence::UpdateWorkflowRequest {
                shard_id,
                range_id: active.engine.shard().range_id(),
                mode: transaction.update_mode,
                record: transaction.record,
                expected_record_version: transaction.expected_record_version,
                tasks: transaction.tasks,
            })
            .await
            .unwrap();
    }

    ship_replication_tasks(&active, &standby).await;

    let active_record = active
        .store
        .get_workflow_execution(shard_id, &"dom".into(), &workflow_id, &run_id)
        .await
        .unwrap();
    let schedule_id = *active_record.activity_infos.keys().next().unwrap();
    let items: Vec<VersionHistoryItem> = active_record
        .version_histories
        .as_ref()
        .unwrap()
        .current()
        .items()
        .to_vec();

    // A worker heartbeats on the active side; the standby reconciles it.
    standby
        .engine
        .sync_activity(SyncActivityRequest {
            domain_id: "dom".into(),
            workflow_id: workflow_id.clone(),
            run_id: run_id.clone(),
            version: 1,
            scheduled_id: schedule_id,
            scheduled_time: Utc::now(),
            started_id: 0,
            started_time: None,
            attempt: 2,
            last_heartbeat_time: Some(Utc::now()),
            details: json!({"uploaded_bytes": 1 << 20}),
            version_history: Some(items),
        })
        .await
        .unwrap();

    let standby_record = standby
        .store
        .get_workflow_execution(shard_id, &"dom".into(), &workflow_id, &run_id)
        .await
        .unwrap();
    let activity = standby_record.activity_infos.get(&schedule_id).unwrap();
    assert_eq!(activity.attempt, 2);
    assert_eq!(activity.details, json!({"uploaded_bytes": 1 << 20}));
}
