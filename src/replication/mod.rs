//! Cross-cluster replication
//!
//! The passive side of N-DC replication: peers drain this cluster's
//! replication queue (`ReplicationMessageReader`), and this cluster applies
//! remote activity progress (`ActivityReplicator`) and remote event batches
//! (`EventsReplicator`) under version-history rules. Conflicts the passive
//! side cannot resolve surface as `RetryTask` hints telling the sender
//! which event range to resend.

pub mod activity;
pub mod events;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::ContextGuard;
use crate::error::{EngineError, EngineResult};
use crate::execution::{DomainId, HistoryEvent, RunId, WorkflowId};
use crate::history::VersionHistoryItem;
use crate::persistence::{HistoryStore, UpdateWorkflowRequest};
use crate::shard::ShardContext;
use crate::state::{MutableState, StateTransaction};
use crate::tasks::{AllocatedTask, ClusterName, ReplicationTask};

/// Remote activity progress to reconcile against local state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncActivityRequest {
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    /// Failover version the remote cluster produced this progress under
    pub version: i64,
    pub scheduled_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub started_id: i64,
    pub started_time: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: serde_json::Value,
    /// Absent on the legacy 2-DC path
    pub version_history: Option<Vec<VersionHistoryItem>>,
}

/// Remote event batch to apply to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateEventsRequest {
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    /// The sender's version history for the run, endpoints oldest first
    pub version_history_items: Vec<VersionHistoryItem>,
    pub events: Vec<HistoryEvent>,
    /// First batch of a continued-as-new successor run, when the last event
    /// closes this run that way
    pub new_run_events: Option<NewRunEvents>,
}

/// Successor-run payload piggybacked on a continued-as-new batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunEvents {
    pub run_id: RunId,
    pub events: Vec<HistoryEvent>,
}

/// A drained slice of a shard's replication queue
#[derive(Debug, Clone)]
pub struct ReplicationMessages {
    pub tasks: Vec<AllocatedTask<ReplicationTask>>,
    pub last_retrieved_id: i64,
    pub has_more: bool,
}

/// Serves `get_replication_messages` polls from peer clusters
pub struct ReplicationMessageReader {
    shard: Arc<ShardContext>,
    batch_size: usize,
}

impl ReplicationMessageReader {
    pub fn new(shard: Arc<ShardContext>, batch_size: usize) -> Self {
        Self { shard, batch_size }
    }

    /// Read the replication queue past the peer's last-read position and
    /// advance its stored ack level.
    pub async fn get_replication_messages(
        &self,
        polling_cluster: ClusterName,
        last_read_id: i64,
    ) -> EngineResult<ReplicationMessages> {
        let tasks = self
            .shard
            .execution_store()
            .get_replication_tasks(self.shard.shard_id(), last_read_id, self.batch_size + 1)
            .await?;
        let has_more = tasks.len() > self.batch_size;
        let tasks: Vec<_> = tasks.into_iter().take(self.batch_size).collect();
        let last_retrieved_id = tasks
            .last()
            .map(|task| task.task_id)
            .unwrap_or(last_read_id);
        self.shard
            .update_cluster_replication_level(polling_cluster, last_retrieved_id)
            .await?;
        metrics::counter!("replication_messages_served").increment(tasks.len() as u64);
        Ok(ReplicationMessages {
            tasks,
            last_retrieved_id,
            has_more,
        })
    }
}

/// Append any new events, then run the conditional execution update.
/// Conflicts drop the cached entry so the next holder reloads.
pub(crate) async fn persist_passive_transaction(
    shard: &ShardContext,
    history_store: &dyn HistoryStore,
    guard: &mut ContextGuard<'_, MutableState>,
    transaction: StateTransaction,
) -> EngineResult<()> {
    if !transaction.new_events.is_empty() {
        history_store
            .append_events(&transaction.branch_token, transaction.new_events)
            .await?;
    }
    let request = UpdateWorkflowRequest {
        shard_id: shard.shard_id(),
        range_id: shard.range_id(),
        mode: transaction.update_mode,
        record: transaction.record,
        expected_record_version: transaction.expected_record_version,
        tasks: transaction.tasks,
    };
    match shard.update_workflow_execution(request).await {
        Ok(()) => {
            if let Some(state) = guard.state() {
                guard.update_size(state.estimate_size());
            }
            Ok(())
        }
        Err(err @ (EngineError::ShardOwnershipLost { .. } | EngineError::ConditionFailed(_))) => {
            guard.clear();
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Load the run into the guard if absent. Returns `false` when the run does
/// not exist, which replication maps to a benign no-op.
pub(crate) async fn ensure_loaded(
    shard: &ShardContext,
    guard: &mut ContextGuard<'_, MutableState>,
    domain_id: &DomainId,
    workflow_id: &WorkflowId,
    run_id: &RunId,
) -> EngineResult<bool> {
    if guard.state().is_some() {
        return Ok(true);
    }
    let record = match shard
        .execution_store()
        .get_workflow_execution(shard.shard_id(), domain_id, workflow_id, run_id)
        .await
    {
        Ok(record) => record,
        Err(EngineError::WorkflowNotExists { .. }) => return Ok(false),
        Err(err) => return Err(err),
    };
    let state = MutableState::from_record(record)?;
    let size = state.estimate_size();
    guard.install(state, size);
    Ok(true)
}
