//! Task list DB
//!
//! A task list is an append-only queue persisted per `(name, type, kind)`.
//! Ownership is a lease fenced by the list's own range id. All conditional
//! writes for one list are serialized through the owner's mutex, which both
//! avoids storage-engine livelock under concurrent lightweight transactions
//! and guarantees exactly one writer at a time. Reads are safe for
//! non-owners.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::execution::{DomainId, RunId, WorkflowId};
use crate::persistence::{PersistedTask, TaskListInfo, TaskListKind, TaskListType, TaskStore};

/// Task ids are carved from a per-lease block, like shard task ids
const TASK_ID_BLOCK_BITS: u32 = 18;

/// A matchable task to append, before an id is assigned
#[derive(Debug, Clone)]
pub struct NewTask {
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub schedule_id: i64,
}

struct Owned {
    info: TaskListInfo,
    next_task_id: i64,
}

/// Owner-side handle on one task list
pub struct TaskListManager {
    store: Arc<dyn TaskStore>,
    name: String,
    task_type: TaskListType,
    kind: TaskListKind,
    owned: Mutex<Owned>,
}

impl TaskListManager {
    /// Take (or steal) the lease: a compare-and-swap that bumps the stored
    /// range id. Any previous owner's pending writes are fenced out.
    pub async fn lease(
        store: Arc<dyn TaskStore>,
        name: impl Into<String>,
        task_type: TaskListType,
        kind: TaskListKind,
    ) -> EngineResult<Self> {
        let name = name.into();
        let info = store.lease_task_list(&name, task_type, kind).await?;
        info!(task_list = %name, range_id = info.range_id, "task list leased");
        let next_task_id = info.range_id << TASK_ID_BLOCK_BITS;
        Ok(Self {
            store,
            name,
            task_type,
            kind,
            owned: Mutex::new(Owned { info, next_task_id }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Range id of the currently held lease
    pub async fn range_id(&self) -> i64 {
        self.owned.lock().await.info.range_id
    }

    pub async fn ack_level(&self) -> i64 {
        self.owned.lock().await.info.ack_level
    }

    /// Re-run the lease CAS, e.g. on a periodic renewal tick
    pub async fn renew_lease(&self) -> EngineResult<()> {
        let mut owned = self.owned.lock().await;
        let info = self
            .store
            .lease_task_list(&self.name, self.task_type, self.kind)
            .await?;
        owned.next_task_id = info.range_id << TASK_ID_BLOCK_BITS;
        owned.info = info;
        Ok(())
    }

    /// Append a batch with contiguous ids. All-or-nothing: a fenced-out
    /// lease fails the whole batch and assigns no ids.
    pub async fn create_tasks(&self, tasks: Vec<NewTask>) -> EngineResult<Vec<i64>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let mut owned = self.owned.lock().await;
        let first_id = owned.next_task_id;
        let persisted: Vec<PersistedTask> = tasks
            .into_iter()
            .enumerate()
            .map(|(offset, task)| PersistedTask {
                task_id: first_id + offset as i64,
                domain_id: task.domain_id,
                workflow_id: task.workflow_id,
                run_id: task.run_id,
                schedule_id: task.schedule_id,
                created_at: Utc::now(),
            })
            .collect();
        let ids: Vec<i64> = persisted.iter().map(|task| task.task_id).collect();
        self.store
            .create_tasks(&self.name, self.task_type, owned.info.range_id, persisted)
            .await?;
        owned.next_task_id = first_id + ids.len() as i64;
        debug!(
            task_list = %self.name,
            first_id,
            count = ids.len(),
            "tasks appended"
        );
        Ok(ids)
    }

    /// Bounded range read; does not require the lease
    pub async fn get_tasks(
        &self,
        min_exclusive: i64,
        max_inclusive: i64,
        batch_size: usize,
    ) -> EngineResult<Vec<PersistedTask>> {
        self.store
            .get_tasks(
                &self.name,
                self.task_type,
                min_exclusive,
                max_inclusive,
                batch_size,
            )
            .await
    }

    /// Best-effort cleanup below the ack level; deleting fewer than `limit`
    /// rows is not an error
    pub async fn complete_tasks_less_than(
        &self,
        upper_bound: i64,
        limit: usize,
    ) -> EngineResult<usize> {
        self.store
            .complete_tasks_less_than(&self.name, self.task_type, upper_bound, limit)
            .await
    }

    /// Owner-only ack level advance, conditional on the lease
    pub async fn update_ack_level(&self, ack_level: i64) -> EngineResult<()> {
        let mut owned = self.owned.lock().await;
        if ack_level < owned.info.ack_level {
            return Err(EngineError::BadRequest(format!(
                "ack level rollback: {} below {}",
                ack_level, owned.info.ack_level
            )));
        }
        let mut info = owned.info.clone();
        info.ack_level = ack_level;
        let expected = owned.info.range_id;
        self.store.update_task_list(info.clone(), expected).await?;
        owned.info = info;
        Ok(())
    }

    /// Owner-only partition routing update, conditional on the lease
    pub async fn update_partition_config(
        &self,
        partition_config: serde_json::Value,
    ) -> EngineResult<()> {
        let mut owned = self.owned.lock().await;
        let mut info = owned.info.clone();
        info.partition_config = partition_config;
        let expected = owned.info.range_id;
        self.store.update_task_list(info.clone(), expected).await?;
        owned.info = info;
        Ok(())
    }

    /// Backlog size past the ack level
    pub async fn size(&self) -> EngineResult<usize> {
        let ack_level = self.owned.lock().await.info.ack_level;
        self.store
            .get_task_list_size(&self.name, self.task_type, ack_level)
            .await
    }
}
