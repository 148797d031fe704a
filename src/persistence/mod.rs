//! Persistence contract
//!
//! The engine core sees storage as an abstract key-value contract with
//! conditional writes. Shard and task-list rows are fenced by a range id;
//! execution rows are fenced by a record version. A conditional mismatch on
//! the shard row surfaces as `ShardOwnershipLost`, everything else as
//! `ConditionFailed`. Concrete drivers (Cassandra, SQL) live outside this
//! crate; `memory::MemoryStore` is the in-process implementation used by
//! tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineResult;
use crate::execution::{DomainId, HistoryEvent, RunId, WorkflowId, WorkflowState};
use crate::history::VersionHistories;
use crate::state::info::{ActivityInfo, ChildExecutionInfo, ExecutionInfo, TimerInfo};
use crate::tasks::{
    AllocatedTask, ClusterName, CrossClusterTask, ReplicationTask, TimerTask, TransferTask,
};

/// Durable shard record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: i32,
    /// Fencing token; bumped on every acquisition
    pub range_id: i64,
    pub transfer_ack_level: i64,
    pub timer_ack_level: DateTime<Utc>,
    /// Per-cluster replication queue ack levels
    pub cluster_replication_level: HashMap<ClusterName, i64>,
    /// Per-cluster timer ack levels
    pub cluster_timer_ack_level: HashMap<ClusterName, DateTime<Utc>>,
    pub owner: Option<String>,
}

impl ShardInfo {
    pub fn new(shard_id: i32) -> Self {
        Self {
            shard_id,
            range_id: 0,
            transfer_ack_level: 0,
            timer_ack_level: Utc::now(),
            cluster_replication_level: HashMap::new(),
            cluster_timer_ack_level: HashMap::new(),
            owner: None,
        }
    }
}

/// Full serialized form of a run's mutable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionRecord {
    pub execution_info: ExecutionInfo,
    pub activity_infos: HashMap<i64, ActivityInfo>,
    pub timer_infos: HashMap<String, TimerInfo>,
    pub child_executions: HashMap<i64, ChildExecutionInfo>,
    pub signal_requested_ids: Vec<String>,
    pub buffered_events: Vec<HistoryEvent>,
    /// `None` on the legacy 2-DC path
    pub version_histories: Option<VersionHistories>,
    pub current_version: i64,
    pub last_write_version: i64,
    /// Optimistic concurrency token, incremented on every committed write
    pub record_version: i64,
}

/// Current-run pointer row for a workflow id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWorkflowRecord {
    pub run_id: RunId,
    pub state: WorkflowState,
    pub last_write_version: i64,
}

/// How a create interacts with the current-run pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateWorkflowMode {
    /// Point the workflow id at the new run; fails if an open current run
    /// exists
    UpdateCurrent,
    /// Insert the run without touching the current pointer (replicated
    /// zombie runs)
    BypassCurrent,
    /// Replace the current pointer that belongs to the given previous run
    ContinueAsNew {
        prev_run_id: RunId,
        prev_last_write_version: i64,
    },
}

/// How an update interacts with the current-run pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateWorkflowMode {
    /// Normal path; also refreshes the pointer's state/version columns
    UpdateCurrent,
    /// Zombie path; the pointer is left alone
    BypassCurrent,
}

/// Tasks to enqueue atomically with a create/update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBatch {
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    pub replication_tasks: Vec<ReplicationTask>,
    pub cross_cluster_tasks: Vec<CrossClusterTask>,
}

impl TaskBatch {
    pub fn is_empty(&self) -> bool {
        self.transfer_tasks.is_empty()
            && self.timer_tasks.is_empty()
            && self.replication_tasks.is_empty()
            && self.cross_cluster_tasks.is_empty()
    }
}

/// Conditional insert of a new run
#[derive(Debug, Clone)]
pub struct CreateWorkflowRequest {
    pub shard_id: i32,
    /// Caller's fencing token; checked against the shard row
    pub range_id: i64,
    pub mode: CreateWorkflowMode,
    pub record: WorkflowExecutionRecord,
    pub tasks: TaskBatch,
}

/// Conditional replace of an existing run's record
#[derive(Debug, Clone)]
pub struct UpdateWorkflowRequest {
    pub shard_id: i32,
    pub range_id: i64,
    pub mode: UpdateWorkflowMode,
    /// Replacement record; `record_version` must match the stored row
    pub record: WorkflowExecutionRecord,
    pub expected_record_version: i64,
    pub tasks: TaskBatch,
}

/// Shard row CRUD
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Read the shard row, creating it at range id 0 on first bootstrap
    async fn get_or_create_shard(&self, shard_id: i32) -> EngineResult<ShardInfo>;

    /// Conditional write: succeeds only while the stored range id equals
    /// `expected_range_id`
    async fn update_shard(&self, shard: ShardInfo, expected_range_id: i64) -> EngineResult<()>;
}

/// Execution row CRUD plus the per-shard task queues written with it
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_workflow_execution(&self, request: CreateWorkflowRequest)
        -> EngineResult<()>;

    async fn update_workflow_execution(&self, request: UpdateWorkflowRequest)
        -> EngineResult<()>;

    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<WorkflowExecutionRecord>;

    async fn get_current_execution(
        &self,
        shard_id: i32,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
    ) -> EngineResult<CurrentWorkflowRecord>;

    async fn delete_workflow_execution(
        &self,
        shard_id: i32,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<()>;

    /// Replication queue read past an ack level, oldest first
    async fn get_replication_tasks(
        &self,
        shard_id: i32,
        read_level: i64,
        batch_size: usize,
    ) -> EngineResult<Vec<AllocatedTask<ReplicationTask>>>;

    /// Timer queue read up to an upper bound on visibility time
    async fn get_timer_tasks(
        &self,
        shard_id: i32,
        max_visibility: DateTime<Utc>,
        batch_size: usize,
    ) -> EngineResult<Vec<AllocatedTask<TimerTask>>>;

    async fn get_transfer_tasks(
        &self,
        shard_id: i32,
        read_level: i64,
        batch_size: usize,
    ) -> EngineResult<Vec<AllocatedTask<TransferTask>>>;
}

/// Append-only event storage organized as a branch tree per run
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create the root branch for a new run and return its token
    async fn new_branch(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<Vec<u8>>;

    /// Append a contiguous event batch; the batch's first event id must be
    /// exactly one past the branch tip
    async fn append_events(
        &self,
        branch_token: &[u8],
        events: Vec<HistoryEvent>,
    ) -> EngineResult<()>;

    /// Fork at `fork_event_id` (inclusive) into a new branch
    async fn fork_branch(
        &self,
        branch_token: &[u8],
        fork_event_id: i64,
    ) -> EngineResult<Vec<u8>>;

    /// Read `[min_event_id, max_event_id)` from a branch
    async fn read_branch(
        &self,
        branch_token: &[u8],
        min_event_id: i64,
        max_event_id: i64,
    ) -> EngineResult<Vec<HistoryEvent>>;

    /// Page through every branch in the tree table
    async fn get_all_branches(
        &self,
        page_size: usize,
        page_token: Option<Vec<u8>>,
    ) -> EngineResult<BranchPage>;

    async fn delete_branch(&self, branch_token: &[u8]) -> EngineResult<()>;
}

/// One page of the history tree scan
#[derive(Debug, Clone)]
pub struct BranchPage {
    pub branches: Vec<BranchRecord>,
    pub next_page_token: Option<Vec<u8>>,
}

/// Tree-table row describing one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub branch_token: Vec<u8>,
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub fork_time: DateTime<Utc>,
}

/// Durable task-list row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskListInfo {
    pub name: String,
    pub task_type: TaskListType,
    pub range_id: i64,
    pub ack_level: i64,
    pub kind: TaskListKind,
    /// Opaque partition routing config, owner-managed
    #[serde(default)]
    pub partition_config: serde_json::Value,
}

/// Decision vs activity task lists are separate queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskListType {
    Decision,
    Activity,
}

/// Sticky lists are bound to one poller and expire with it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskListKind {
    Normal,
    Sticky,
}

/// A matchable task persisted on a task list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub task_id: i64,
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub schedule_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Task-list rows and their append-only task queues
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// CAS on the stored range id: read, increment, write back. On success
    /// the caller owns the list.
    async fn lease_task_list(
        &self,
        name: &str,
        task_type: TaskListType,
        kind: TaskListKind,
    ) -> EngineResult<TaskListInfo>;

    /// Owner-only metadata write, conditional on range id
    async fn update_task_list(
        &self,
        info: TaskListInfo,
        expected_range_id: i64,
    ) -> EngineResult<()>;

    /// Fenced append; all-or-nothing
    async fn create_tasks(
        &self,
        name: &str,
        task_type: TaskListType,
        range_id: i64,
        tasks: Vec<PersistedTask>,
    ) -> EngineResult<()>;

    /// Bounded range read `(min_exclusive, max_inclusive]`; safe for
    /// non-owners
    async fn get_tasks(
        &self,
        name: &str,
        task_type: TaskListType,
        min_exclusive: i64,
        max_inclusive: i64,
        batch_size: usize,
    ) -> EngineResult<Vec<PersistedTask>>;

    /// Best-effort delete below `upper_bound` (exclusive); returns the
    /// number removed, which may be less than `limit`
    async fn complete_tasks_less_than(
        &self,
        name: &str,
        task_type: TaskListType,
        upper_bound: i64,
        limit: usize,
    ) -> EngineResult<usize>;

    async fn get_task_list_size(
        &self,
        name: &str,
        task_type: TaskListType,
        ack_level: i64,
    ) -> EngineResult<usize>;
}
