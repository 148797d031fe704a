//! History engine
//!
//! One engine drives one shard: it owns the execution cache, the passive
//! replicators and the replication queue reader, and serves the active
//! paths (start workflow, apply decisions). Every public operation runs
//! under the configured deadline; on expiry the in-flight work is dropped,
//! cached state is safe to reload, and `Timeout` surfaces upward.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cache::ExecutionCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::{DomainId, EventType, RunId, WorkflowId, WorkflowKey};
use crate::persistence::{
    CreateWorkflowMode, CreateWorkflowRequest, HistoryStore, WorkflowExecutionRecord,
};
use crate::replication::activity::ActivityReplicator;
use crate::replication::events::EventsReplicator;
use crate::replication::{
    ReplicateEventsRequest, ReplicationMessageReader, ReplicationMessages, SyncActivityRequest,
};
use crate::shard::{verify_shard_routing, ShardContext};
use crate::state::MutableState;
use crate::tasks::ClusterName;

/// Active-path request to start a new run
#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub task_list: String,
    /// The domain's current failover version in this cluster
    pub failover_version: i64,
}

/// Per-shard engine facade
pub struct HistoryEngine {
    shard: Arc<ShardContext>,
    cache: Arc<ExecutionCache<MutableState>>,
    history_store: Arc<dyn HistoryStore>,
    config: EngineConfig,
    activity_replicator: ActivityReplicator,
    events_replicator: EventsReplicator,
    message_reader: ReplicationMessageReader,
}

impl HistoryEngine {
    pub fn new(
        shard: Arc<ShardContext>,
        history_store: Arc<dyn HistoryStore>,
        config: EngineConfig,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;
        let cache = Arc::new(ExecutionCache::new(config.execution_cache_max_bytes));
        let activity_replicator = ActivityReplicator::new(
            Arc::clone(&shard),
            Arc::clone(&cache),
            Arc::clone(&history_store),
        );
        let events_replicator = EventsReplicator::new(
            Arc::clone(&shard),
            Arc::clone(&cache),
            Arc::clone(&history_store),
        );
        let message_reader =
            ReplicationMessageReader::new(Arc::clone(&shard), config.replication_batch_size);
        info!(shard_id = shard.shard_id(), "history engine started");
        Ok(Arc::new(Self {
            shard,
            cache,
            history_store,
            config,
            activity_replicator,
            events_replicator,
            message_reader,
        }))
    }

    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    pub fn cache(&self) -> &Arc<ExecutionCache<MutableState>> {
        &self.cache
    }

    /// Start a new run: first event batch, current-pointer update, initial
    /// transfer and replication tasks, all in one conditional create.
    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> EngineResult<RunId> {
        self.with_deadline(async {
            verify_shard_routing(
                self.shard.shard_id(),
                self.config.shard_count,
                &request.domain_id,
                &request.workflow_id,
            )?;

            let run_id = RunId::generate();
            let branch_token = self
                .history_store
                .new_branch(&request.domain_id, &request.workflow_id, &run_id)
                .await?;
            let mut state = MutableState::new_for_start(
                request.domain_id.clone(),
                request.workflow_id.clone(),
                run_id.clone(),
                request.task_list.clone(),
                request.failover_version,
                branch_token,
            );
            state.apply_events(vec![
                (
                    EventType::WorkflowExecutionStarted,
                    serde_json::json!({"task_list": request.task_list}),
                ),
                (
                    EventType::DecisionTaskScheduled,
                    serde_json::json!({"task_list": request.task_list}),
                ),
            ])?;
            let transaction = state.close_transaction_as_active()?;
            self.history_store
                .append_events(&transaction.branch_token, transaction.new_events)
                .await?;
            self.shard
                .create_workflow_execution(CreateWorkflowRequest {
                    shard_id: self.shard.shard_id(),
                    range_id: self.shard.range_id(),
                    mode: CreateWorkflowMode::UpdateCurrent,
                    record: transaction.record,
                    tasks: transaction.tasks,
                })
                .await?;

            let key = WorkflowKey::new(
                request.domain_id.clone(),
                request.workflow_id.clone(),
                run_id.clone(),
            );
            let context = self.cache.get_or_create(&key);
            let mut guard = context.lock().await;
            let size = state.estimate_size();
            guard.install(state, size);

            metrics::counter!("workflow_started").increment(1);
            Ok(run_id)
        })
        .await
    }

    /// Passive activity reconciliation, see the replication module
    pub async fn sync_activity(&self, request: SyncActivityRequest) -> EngineResult<()> {
        self.with_deadline(self.activity_replicator.sync_activity(request))
            .await
    }

    /// Passive event application, see the replication module
    pub async fn replicate_events(&self, request: ReplicateEventsRequest) -> EngineResult<()> {
        self.with_deadline(self.events_replicator.replicate_events(request))
            .await
    }

    /// Serve a peer cluster's replication poll
    pub async fn get_replication_messages(
        &self,
        polling_cluster: ClusterName,
        last_read_id: i64,
    ) -> EngineResult<ReplicationMessages> {
        self.with_deadline(
            self.message_reader
                .get_replication_messages(polling_cluster, last_read_id),
        )
        .await
    }

    /// Record a peer cluster's shard watermark
    pub async fn sync_shard_status(
        &self,
        source_cluster: ClusterName,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<()> {
        self.with_deadline(self.shard.sync_shard_status(source_cluster, timestamp))
            .await
    }

    /// Raw record read, used by operational tooling
    pub async fn describe_mutable_state(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<WorkflowExecutionRecord> {
        self.with_deadline(self.shard.execution_store().get_workflow_execution(
            self.shard.shard_id(),
            domain_id,
            workflow_id,
            run_id,
        ))
        .await
    }

    /// Drop a run from the cache so the next access reloads
    pub fn invalidate_cached_run(&self, key: &WorkflowKey) {
        self.cache.remove(key);
    }

    async fn with_deadline<T>(
        &self,
        operation: impl Future<Output = EngineResult<T>>,
    ) -> EngineResult<T> {
        let budget = Duration::from_millis(self.config.operation_timeout_ms);
        match tokio::time::timeout(budget, operation).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout),
        }
    }
}
