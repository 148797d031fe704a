//! Shard context
//!
//! A shard is the unit of ownership: every run hashes to exactly one shard,
//! and a shard has a single writer at a time. Acquisition atomically bumps
//! the shard record's range id; all subsequent conditional writes carry it,
//! so a stale owner's writes are rejected by storage and surface as
//! `ShardOwnershipLost`. Task ids are allocated from a block derived from
//! the range id, which keeps queue positions of different owners disjoint.

pub mod registry;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::execution::{DomainId, WorkflowId};
use crate::persistence::{
    CreateWorkflowRequest, ExecutionStore, ShardInfo, ShardStore, UpdateWorkflowRequest,
};
use crate::tasks::ClusterName;

/// Task ids are carved from a per-lease block so two owners can never
/// allocate overlapping ids.
const TASK_ID_BLOCK_BITS: u32 = 20;

/// Number of shards a cluster is partitioned into; workflow ids hash onto
/// this range
pub fn shard_for(workflow_id: &WorkflowId, shard_count: i32) -> i32 {
    // FNV-1a; stable across hosts, unlike the std hasher.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in workflow_id.as_str().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % shard_count as u64) as i32
}

struct TaskIdBlock {
    next: i64,
    max: i64,
}

/// Owned handle on one shard
pub struct ShardContext {
    shard_id: i32,
    owner: String,
    info: RwLock<ShardInfo>,
    shard_store: Arc<dyn ShardStore>,
    execution_store: Arc<dyn ExecutionStore>,
    task_ids: Mutex<TaskIdBlock>,
    lost: AtomicBool,
    transfer_notify: Notify,
    timer_notify: Notify,
    replication_notify: Notify,
}

impl ShardContext {
    /// Acquire the shard: read the record, bump the range id, write it back
    /// conditionally on the old value. Success grants the lease.
    pub async fn acquire(
        shard_store: Arc<dyn ShardStore>,
        execution_store: Arc<dyn ExecutionStore>,
        shard_id: i32,
        owner: impl Into<String>,
    ) -> EngineResult<Arc<ShardContext>> {
        let owner = owner.into();
        let mut info = shard_store.get_or_create_shard(shard_id).await?;
        let previous_range = info.range_id;
        info.range_id += 1;
        info.owner = Some(owner.clone());
        shard_store.update_shard(info.clone(), previous_range).await?;

        info!(shard_id, range_id = info.range_id, %owner, "shard acquired");
        let block_start = info.range_id << TASK_ID_BLOCK_BITS;
        Ok(Arc::new(ShardContext {
            shard_id,
            owner,
            info: RwLock::new(info),
            shard_store,
            execution_store,
            task_ids: Mutex::new(TaskIdBlock {
                next: block_start,
                max: block_start + (1 << TASK_ID_BLOCK_BITS),
            }),
            lost: AtomicBool::new(false),
            transfer_notify: Notify::new(),
            timer_notify: Notify::new(),
            replication_notify: Notify::new(),
        }))
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Fencing token of the current lease
    pub fn range_id(&self) -> i64 {
        self.info.read().range_id
    }

    /// Whether a conditional write has already failed the fence
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Next task id from the leased block
    pub fn next_task_id(&self) -> EngineResult<i64> {
        let mut block = self.task_ids.lock();
        if block.next >= block.max {
            return Err(EngineError::Retriable(
                "task id block exhausted; shard must renew its lease".into(),
            ));
        }
        let id = block.next;
        block.next += 1;
        Ok(id)
    }

    pub fn transfer_ack_level(&self) -> i64 {
        self.info.read().transfer_ack_level
    }

    pub fn timer_ack_level(&self) -> DateTime<Utc> {
        self.info.read().timer_ack_level
    }

    /// Replication ack level a peer cluster has confirmed
    pub fn cluster_replication_level(&self, cluster: &str) -> i64 {
        self.info
            .read()
            .cluster_replication_level
            .get(cluster)
            .copied()
            .unwrap_or(0)
    }

    /// Persist an updated transfer ack level
    pub async fn update_transfer_ack_level(&self, ack_level: i64) -> EngineResult<()> {
        self.write_info(|info| info.transfer_ack_level = ack_level)
            .await
    }

    /// Persist an updated timer ack level
    pub async fn update_timer_ack_level(&self, ack_level: DateTime<Utc>) -> EngineResult<()> {
        self.write_info(|info| info.timer_ack_level = ack_level).await
    }

    /// Record how far a peer cluster has read our replication queue
    pub async fn update_cluster_replication_level(
        &self,
        cluster: ClusterName,
        ack_level: i64,
    ) -> EngineResult<()> {
        self.write_info(|info| {
            info.cluster_replication_level.insert(cluster, ack_level);
        })
        .await
    }

    /// Apply a peer cluster's shard-status report (its timer watermark)
    pub async fn sync_shard_status(
        &self,
        source_cluster: ClusterName,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.write_info(|info| {
            info.cluster_timer_ack_level.insert(source_cluster, timestamp);
        })
        .await
    }

    async fn write_info(&self, mutate: impl FnOnce(&mut ShardInfo)) -> EngineResult<()> {
        let (updated, range_id) = {
            let mut info = self.info.write();
            mutate(&mut info);
            (info.clone(), info.range_id)
        };
        match self.shard_store.update_shard(updated, range_id).await {
            Ok(()) => Ok(()),
            Err(err @ EngineError::ShardOwnershipLost { .. }) => {
                self.mark_lost();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            warn!(
                shard_id = self.shard_id,
                owner = %self.owner,
                "shard ownership lost; dropping in-memory state"
            );
        }
    }

    /// Conditional create carrying this lease's fencing token
    pub async fn create_workflow_execution(
        &self,
        mut request: CreateWorkflowRequest,
    ) -> EngineResult<()> {
        request.shard_id = self.shard_id;
        request.range_id = self.range_id();
        let had_transfer = !request.tasks.transfer_tasks.is_empty();
        let had_timers = !request.tasks.timer_tasks.is_empty();
        let had_replication = !request.tasks.replication_tasks.is_empty();
        let result = self.execution_store.create_workflow_execution(request).await;
        self.after_write(result, had_transfer, had_timers, had_replication)
    }

    /// Conditional update carrying this lease's fencing token
    pub async fn update_workflow_execution(
        &self,
        mut request: UpdateWorkflowRequest,
    ) -> EngineResult<()> {
        request.shard_id = self.shard_id;
        request.range_id = self.range_id();
        let had_transfer = !request.tasks.transfer_tasks.is_empty();
        let had_timers = !request.tasks.timer_tasks.is_empty();
        let had_replication = !request.tasks.replication_tasks.is_empty();
        let result = self.execution_store.update_workflow_execution(request).await;
        self.after_write(result, had_transfer, had_timers, had_replication)
    }

    fn after_write(
        &self,
        result: EngineResult<()>,
        had_transfer: bool,
        had_timers: bool,
        had_replication: bool,
    ) -> EngineResult<()> {
        match result {
            Ok(()) => {
                if had_transfer {
                    self.notify_new_transfer_tasks();
                }
                if had_timers {
                    self.notify_new_timer_tasks();
                }
                if had_replication {
                    self.notify_new_replication_tasks();
                }
                Ok(())
            }
            Err(err @ EngineError::ShardOwnershipLost { .. }) => {
                self.mark_lost();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Best-effort wakeup; consumers always re-check persistence for work
    pub fn notify_new_transfer_tasks(&self) {
        self.transfer_notify.notify_waiters();
    }

    pub fn notify_new_timer_tasks(&self) {
        self.timer_notify.notify_waiters();
    }

    pub fn notify_new_replication_tasks(&self) {
        self.replication_notify.notify_waiters();
    }

    /// Await the next transfer-task wakeup
    pub async fn transfer_tasks_notified(&self) {
        self.transfer_notify.notified().await;
    }

    pub async fn timer_tasks_notified(&self) {
        self.timer_notify.notified().await;
    }

    pub async fn replication_tasks_notified(&self) {
        self.replication_notify.notified().await;
    }

    /// Execution store handle for readers (queue processors)
    pub fn execution_store(&self) -> &Arc<dyn ExecutionStore> {
        &self.execution_store
    }
}

/// Shard routing sanity check used by engines before touching a run
pub fn verify_shard_routing(
    shard_id: i32,
    shard_count: i32,
    _domain_id: &DomainId,
    workflow_id: &WorkflowId,
) -> EngineResult<()> {
    let expected = shard_for(workflow_id, shard_count);
    if expected != shard_id {
        return Err(EngineError::BadRequest(format!(
            "workflow {workflow_id} belongs to shard {expected}, not {shard_id}"
        )));
    }
    Ok(())
}
