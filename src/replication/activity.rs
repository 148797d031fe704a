//! Passive activity replication
//!
//! Applies a remote cluster's activity heartbeat or state change against
//! local mutable state. Newness is decided by the `(version, attempt)`
//! pair, never by timestamps. Runs without version histories take the
//! legacy 2-DC path and compare failover versions against the run's last
//! write version; the two shapes are never mixed.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use super::{ensure_loaded, persist_passive_transaction, SyncActivityRequest};
use crate::cache::ExecutionCache;
use crate::error::{EngineError, EngineResult};
use crate::execution::WorkflowKey;
use crate::history::{VersionHistory, VersionHistoryItem};
use crate::persistence::HistoryStore;
use crate::shard::ShardContext;
use crate::state::MutableState;
use crate::tasks::TimerTask;

/// Outcome of version-history reconciliation before the activity compare
enum HistoryCheck {
    Proceed,
    Discard,
    Retry(VersionHistoryItem),
}

/// Applies `sync_activity` requests on the passive side
pub struct ActivityReplicator {
    shard: Arc<ShardContext>,
    cache: Arc<ExecutionCache<MutableState>>,
    history_store: Arc<dyn HistoryStore>,
}

impl ActivityReplicator {
    pub fn new(
        shard: Arc<ShardContext>,
        cache: Arc<ExecutionCache<MutableState>>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            shard,
            cache,
            history_store,
        }
    }

    /// Apply one remote activity update. Stale or already-deleted inputs
    /// are idempotent successes; missing events surface as `RetryTask`.
    pub async fn sync_activity(&self, request: SyncActivityRequest) -> EngineResult<()> {
        let key = WorkflowKey::new(
            request.domain_id.clone(),
            request.workflow_id.clone(),
            request.run_id.clone(),
        );
        let context = self.cache.get_or_create(&key);
        let mut guard = context.lock().await;

        // Run already deleted by retention: nothing to reconcile.
        if !ensure_loaded(
            &self.shard,
            &mut guard,
            &request.domain_id,
            &request.workflow_id,
            &request.run_id,
        )
        .await?
        {
            metrics::counter!("sync_activity_noop", "reason" => "not_found").increment(1);
            return Ok(());
        }

        let state = guard.state().ok_or_else(|| {
            EngineError::Internal("mutable state vanished under lock".into())
        })?;

        if state.is_closed() {
            metrics::counter!("sync_activity_noop", "reason" => "closed").increment(1);
            return Ok(());
        }

        match self.check_version_history(state, &request)? {
            HistoryCheck::Discard => {
                metrics::counter!("sync_activity_noop", "reason" => "stale_history")
                    .increment(1);
                return Ok(());
            }
            HistoryCheck::Retry(resend_from) => {
                metrics::counter!("sync_activity_retry").increment(1);
                return Err(EngineError::retry_task_from(
                    "activity events missing locally",
                    request.domain_id,
                    request.workflow_id,
                    request.run_id,
                    resend_from.event_id,
                    resend_from.version,
                ));
            }
            HistoryCheck::Proceed => {}
        }

        // Activity gone means it already completed locally.
        let Some(local_activity) = state.activity(request.scheduled_id) else {
            metrics::counter!("sync_activity_noop", "reason" => "activity_completed")
                .increment(1);
            return Ok(());
        };

        // `(version, attempt)` decides newness; within the same attempt a
        // strictly fresher heartbeat still counts as progress, which keeps
        // replays of an applied update idempotent.
        let incoming_newness = (request.version, request.attempt);
        let local_newness = local_activity.newness();
        let accept = incoming_newness > local_newness
            || (incoming_newness == local_newness
                && request.last_heartbeat_time > local_activity.last_heartbeat_time);
        if !accept {
            metrics::counter!("sync_activity_noop", "reason" => "stale_state").increment(1);
            return Ok(());
        }

        let mut activity = local_activity.clone();
        activity.version = request.version;
        activity.scheduled_time = request.scheduled_time;
        activity.started_id = request.started_id;
        activity.started_time = request.started_time;
        activity.attempt = request.attempt;
        activity.last_heartbeat_time = request.last_heartbeat_time;
        activity.details = request.details.clone();
        activity.retry_timer_pending = true;
        debug!(
            workflow_id = %request.workflow_id,
            run_id = %request.run_id,
            scheduled_id = request.scheduled_id,
            version = request.version,
            attempt = request.attempt,
            "accepting replicated activity state"
        );

        let state = guard.state_mut().ok_or_else(|| {
            EngineError::Internal("mutable state vanished under lock".into())
        })?;
        state.put_activity(activity);
        // Retry timer sized from the remote's own clock, so local skew does
        // not shorten the backoff.
        state.add_timer_task(TimerTask::ActivityRetryTimer {
            domain_id: request.domain_id.clone(),
            workflow_id: request.workflow_id.clone(),
            run_id: request.run_id.clone(),
            schedule_id: request.scheduled_id,
            attempt: request.attempt,
            visibility_time: request.scheduled_time,
        });

        let transaction = state.close_transaction_as_passive()?;
        persist_passive_transaction(
            &self.shard,
            self.history_store.as_ref(),
            &mut guard,
            transaction,
        )
        .await?;
        metrics::counter!("sync_activity_applied").increment(1);
        Ok(())
    }

    /// Steps 4 and 5 of the decision procedure: reconcile the incoming
    /// version history (or legacy last-write version) with local state.
    fn check_version_history(
        &self,
        state: &MutableState,
        request: &SyncActivityRequest,
    ) -> EngineResult<HistoryCheck> {
        let Some(histories) = state.version_histories() else {
            // Legacy 2-DC path: only the failover version is comparable.
            // A remote ahead of us is still a no-op here; its events arrive
            // through the event replication path.
            return Ok(match request.version.cmp(&state.last_write_version()) {
                Ordering::Less => HistoryCheck::Discard,
                Ordering::Greater => HistoryCheck::Discard,
                Ordering::Equal => HistoryCheck::Proceed,
            });
        };

        let Some(items) = &request.version_history else {
            return Err(EngineError::BadRequest(
                "request lacks a version history but the run has one".into(),
            ));
        };
        let incoming = VersionHistory::new(Vec::new(), items.clone())?;
        let local = histories.current();
        let local_tip = local.last_item()?;
        let incoming_tip = incoming.last_item()?;

        match incoming_tip.version.cmp(&local_tip.version) {
            // Local branch superseded the incoming lineage.
            Ordering::Less => Ok(HistoryCheck::Discard),
            // The remote knows a newer failover era; its events must land
            // before any activity state can be compared.
            Ordering::Greater => Ok(HistoryCheck::Retry(local.lowest_common_item(&incoming)?)),
            Ordering::Equal => {
                if request.scheduled_id >= state.next_event_id() {
                    // Same lineage but the scheduled event is not here yet.
                    Ok(HistoryCheck::Retry(local.lowest_common_item(&incoming)?))
                } else {
                    Ok(HistoryCheck::Proceed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::EventType;
    use crate::persistence::memory::MemoryStore;
    use crate::persistence::{CreateWorkflowMode, CreateWorkflowRequest, ExecutionStore};
    use crate::persistence::{ShardStore, TaskBatch};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        replicator: ActivityReplicator,
        store: Arc<MemoryStore>,
        shard: Arc<ShardContext>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let shard = ShardContext::acquire(
            store.clone() as Arc<dyn ShardStore>,
            store.clone() as Arc<dyn ExecutionStore>,
            0,
            "test-host",
        )
        .await
        .unwrap();
        let cache = Arc::new(ExecutionCache::new(1 << 20));
        let replicator = ActivityReplicator::new(
            Arc::clone(&shard),
            cache,
            store.clone() as Arc<dyn HistoryStore>,
        );
        Fixture {
            replicator,
            store,
            shard,
        }
    }

    /// Seed a running workflow with one scheduled activity and the given
    /// version history tip.
    async fn seed_workflow(fixture: &Fixture, run_id: &str, tip_version: i64) -> i64 {
        let mut state = MutableState::new_for_start(
            "dom".into(),
            "wf".into(),
            run_id.into(),
            "tl".into(),
            tip_version,
            b"branch".to_vec(),
        );
        state
            .apply_events(vec![
                (EventType::WorkflowExecutionStarted, json!({})),
                (
                    EventType::ActivityTaskScheduled,
                    json!({"activity_id": "charge"}),
                ),
            ])
            .unwrap();
        let schedule_id = state.next_event_id() - 1;
        let transaction = state.close_transaction_as_active().unwrap();
        fixture
            .shard
            .create_workflow_execution(CreateWorkflowRequest {
                shard_id: 0,
                range_id: 0,
                mode: CreateWorkflowMode::UpdateCurrent,
                record: transaction.record,
                tasks: TaskBatch::default(),
            })
            .await
            .unwrap();
        schedule_id
    }

    fn request(run_id: &str, version: i64, scheduled_id: i64) -> SyncActivityRequest {
        SyncActivityRequest {
            domain_id: "dom".into(),
            workflow_id: "wf".into(),
            run_id: run_id.into(),
            version,
            scheduled_id,
            scheduled_time: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            started_id: 0,
            started_time: None,
            attempt: 1,
            last_heartbeat_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 1, 0).unwrap()),
            details: json!({"progress": 10}),
            version_history: Some(vec![VersionHistoryItem::new(scheduled_id, version)]),
        }
    }

    #[tokio::test]
    async fn test_missing_workflow_is_noop() {
        let fixture = fixture().await;
        fixture
            .replicator
            .sync_activity(request("no-such-run", 100, 144))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_accepted_and_persisted() {
        let fixture = fixture().await;
        let schedule_id = seed_workflow(&fixture, "run-1", 100).await;

        let mut req = request("run-1", 100, schedule_id);
        req.version_history = Some(vec![VersionHistoryItem::new(schedule_id, 100)]);
        fixture.replicator.sync_activity(req.clone()).await.unwrap();

        let record = fixture
            .store
            .get_workflow_execution(0, &"dom".into(), &"wf".into(), &"run-1".into())
            .await
            .unwrap();
        let activity = record.activity_infos.get(&schedule_id).unwrap();
        assert_eq!(activity.attempt, 1);
        assert_eq!(activity.last_heartbeat_time, req.last_heartbeat_time);
        assert_eq!(activity.details, json!({"progress": 10}));
    }

    #[tokio::test]
    async fn test_stale_version_attempt_is_noop() {
        let fixture = fixture().await;
        let schedule_id = seed_workflow(&fixture, "run-1", 100).await;

        let mut newer = request("run-1", 100, schedule_id);
        newer.attempt = 3;
        fixture.replicator.sync_activity(newer).await.unwrap();

        // Replay with a lower attempt: dominated, no write.
        let before = fixture
            .store
            .get_workflow_execution(0, &"dom".into(), &"wf".into(), &"run-1".into())
            .await
            .unwrap();
        let mut stale = request("run-1", 100, schedule_id);
        stale.attempt = 1;
        fixture.replicator.sync_activity(stale).await.unwrap();
        let after = fixture
            .store
            .get_workflow_execution(0, &"dom".into(), &"wf".into(), &"run-1".into())
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_events_ahead_returns_retry_hint() {
        let fixture = fixture().await;
        let _ = seed_workflow(&fixture, "run-1", 100).await;
        // Local branch tip is (2, 100); the remote speaks of event 144.
        let mut req = request("run-1", 100, 144);
        req.version_history = Some(vec![VersionHistoryItem::new(144, 100)]);
        let err = fixture.replicator.sync_activity(req).await.unwrap_err();
        match err {
            EngineError::RetryTask {
                start_event_id,
                start_event_version,
                ..
            } => {
                assert_eq!(start_event_id, Some(2));
                assert_eq!(start_event_version, Some(100));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dominated_history_is_discarded() {
        let fixture = fixture().await;
        let schedule_id = seed_workflow(&fixture, "run-1", 100).await;
        // Incoming lineage ended at an older failover version.
        let mut req = request("run-1", 99, schedule_id);
        req.version_history = Some(vec![VersionHistoryItem::new(200, 99)]);
        fixture.replicator.sync_activity(req).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_activity_is_idempotent() {
        let fixture = fixture().await;
        let schedule_id = seed_workflow(&fixture, "run-1", 100).await;
        let req = request("run-1", 100, schedule_id);

        fixture.replicator.sync_activity(req.clone()).await.unwrap();
        let first = fixture
            .store
            .get_workflow_execution(0, &"dom".into(), &"wf".into(), &"run-1".into())
            .await
            .unwrap();

        fixture.replicator.sync_activity(req).await.unwrap();
        let second = fixture
            .store
            .get_workflow_execution(0, &"dom".into(), &"wf".into(), &"run-1".into())
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
