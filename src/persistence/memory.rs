//! In-process persistence used by tests and single-node runs
//!
//! Mirrors the conditional-write semantics a real driver provides: shard
//! writes are fenced by range id, execution writes by record version,
//! task-list writes by the list's own range id. All maps live behind one
//! mutex; methods never await while holding it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::{
    BranchPage, BranchRecord, CreateWorkflowMode, CreateWorkflowRequest, CurrentWorkflowRecord,
    ExecutionStore, HistoryStore, PersistedTask, ShardInfo, ShardStore, TaskBatch, TaskListInfo,
    TaskListKind, TaskListType, TaskStore, UpdateWorkflowMode, UpdateWorkflowRequest,
    WorkflowExecutionRecord,
};
use crate::error::{EngineError, EngineResult};
use crate::execution::{DomainId, HistoryEvent, RunId, WorkflowId};
use crate::tasks::{AllocatedTask, ReplicationTask, TimerTask, TransferTask};

type ExecutionKey = (i32, DomainId, WorkflowId, RunId);
type CurrentKey = (i32, DomainId, WorkflowId);
type ListKey = (String, TaskListType);

#[derive(Default)]
struct ShardQueues {
    next_transfer_id: i64,
    next_replication_id: i64,
    transfer: BTreeMap<i64, TransferTask>,
    replication: BTreeMap<i64, ReplicationTask>,
    timers: Vec<AllocatedTask<TimerTask>>,
    next_timer_seq: i64,
}

struct BranchData {
    record: BranchRecord,
    events: Vec<HistoryEvent>,
}

struct TaskListState {
    info: TaskListInfo,
    tasks: BTreeMap<i64, PersistedTask>,
}

#[derive(Default)]
struct Inner {
    shards: HashMap<i32, ShardInfo>,
    executions: HashMap<ExecutionKey, WorkflowExecutionRecord>,
    current: HashMap<CurrentKey, CurrentWorkflowRecord>,
    branches: HashMap<Vec<u8>, BranchData>,
    branch_order: Vec<Vec<u8>>,
    queues: HashMap<i32, ShardQueues>,
    task_lists: HashMap<ListKey, TaskListState>,
}

/// In-memory implementation of the full persistence contract
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_shard_range(inner: &Inner, shard_id: i32, range_id: i64) -> EngineResult<()> {
        let stored = inner
            .shards
            .get(&shard_id)
            .map(|shard| shard.range_id)
            .unwrap_or(0);
        if stored != range_id {
            return Err(EngineError::ShardOwnershipLost {
                shard_id,
                held_range_id: range_id,
            });
        }
        Ok(())
    }

    fn enqueue_tasks(inner: &mut Inner, shard_id: i32, tasks: TaskBatch) {
        let queues = inner.queues.entry(shard_id).or_default();
        for task in tasks.transfer_tasks {
            queues.next_transfer_id += 1;
            queues.transfer.insert(queues.next_transfer_id, task);
        }
        for task in tasks.replication_tasks {
            queues.next_replication_id += 1;
            queues.replication.insert(queues.next_replication_id, task);
        }
        for task in tasks.timer_tasks {
            queues.next_timer_seq += 1;
            queues.timers.push(AllocatedTask {
                task_id: queues.next_timer_seq,
                task,
            });
        }
        queues
            .timers
            .sort_by_key(|allocated| (allocated.task.visibility_time(), allocated.task_id));
        // Cross-cluster tasks are drained by the peer-RPC processor, which
        // is outside this crate; they are accepted and dropped here.
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    async fn get_or_create_shard(&self, shard_id: i32) -> EngineResult<ShardInfo> {
        let mut inner = self.inner.lock();
        Ok(inner
            .shards
            .entry(shard_id)
            .or_insert_with(|| ShardInfo::new(shard_id))
            .clone())
    }

    async fn update_shard(&self, shard: ShardInfo, expected_range_id: i64) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let stored = inner
            .shards
            .entry(shard.shard_id)
            .or_insert_with(|| ShardInfo::new(shard.shard_id));
        if stored.range_id != expected_range_id {
            return Err(EngineError::ShardOwnershipLost {
                shard_id: shard.shard_id,
                held_range_id: expected_range_id,
            });
        }
        *stored = shard;
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowRequest,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        Self::check_shard_range(&inner, request.shard_id, request.range_id)?;

        let info = &request.record.execution_info;
        let execution_key = (
            request.shard_id,
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        if inner.executions.contains_key(&execution_key) {
            return Err(EngineError::ConditionFailed(format!(
                "run {} already exists",
                info.run_id
            )));
        }

        let current_key = (
            request.shard_id,
            info.domain_id.clone(),
            info.workflow_id.clone(),
        );
        match &request.mode {
            CreateWorkflowMode::UpdateCurrent => {
                if let Some(current) = inner.current.get(&current_key) {
                    if !current.state.is_closed() {
                        return Err(EngineError::WorkflowAlreadyStarted {
                            workflow_id: info.workflow_id.clone(),
                            run_id: current.run_id.clone(),
                        });
                    }
                }
                inner.current.insert(
                    current_key,
                    CurrentWorkflowRecord {
                        run_id: info.run_id.clone(),
                        state: info.state,
                        last_write_version: request.record.last_write_version,
                    },
                );
            }
            CreateWorkflowMode::BypassCurrent => {
                if let Some(current) = inner.current.get(&current_key) {
                    if current.run_id == info.run_id {
                        return Err(EngineError::ConditionFailed(format!(
                            "run {} is current; bypass create refused",
                            info.run_id
                        )));
                    }
                }
            }
            CreateWorkflowMode::ContinueAsNew {
                prev_run_id,
                prev_last_write_version,
            } => {
                let current = inner.current.get(&current_key).ok_or_else(|| {
                    EngineError::ConditionFailed("no current run to continue".into())
                })?;
                if &current.run_id != prev_run_id
                    || current.last_write_version != *prev_last_write_version
                {
                    return Err(EngineError::ConditionFailed(format!(
                        "current run moved: expected {} v{}, found {} v{}",
                        prev_run_id,
                        prev_last_write_version,
                        current.run_id,
                        current.last_write_version
                    )));
                }
                inner.current.insert(
                    current_key,
                    CurrentWorkflowRecord {
                        run_id: info.run_id.clone(),
                        state: info.state,
                        last_write_version: request.record.last_write_version,
                    },
                );
            }
        }

        let mut record = request.record;
        record.record_version = 1;
        inner.executions.insert(execution_key, record);
        Self::enqueue_tasks(&mut inner, request.shard_id, request.tasks);
        Ok(())
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowRequest,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        Self::check_shard_range(&inner, request.shard_id, request.range_id)?;

        let info = &request.record.execution_info;
        let execution_key = (
            request.shard_id,
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        let current_key = (
            request.shard_id,
            info.domain_id.clone(),
            info.workflow_id.clone(),
        );

        let stored = inner.executions.get(&execution_key).ok_or_else(|| {
            EngineError::WorkflowNotExists {
                domain_id: info.domain_id.clone(),
                workflow_id: info.workflow_id.clone(),
                run_id: info.run_id.clone(),
            }
        })?;
        if stored.record_version != request.expected_record_version {
            return Err(EngineError::ConditionFailed(format!(
                "record version moved: expected {}, found {}",
                request.expected_record_version, stored.record_version
            )));
        }

        match request.mode {
            UpdateWorkflowMode::UpdateCurrent => {
                let current = inner.current.get_mut(&current_key).ok_or_else(|| {
                    EngineError::ConditionFailed("no current run for update".into())
                })?;
                if current.run_id != info.run_id {
                    return Err(EngineError::ConditionFailed(format!(
                        "run {} is not current",
                        info.run_id
                    )));
                }
                current.state = info.state;
                current.last_write_version = request.record.last_write_version;
            }
            UpdateWorkflowMode::BypassCurrent => {
                if let Some(current) = inner.current.get(&current_key) {
                    if current.run_id == info.run_id {
                        return Err(EngineError::ConditionFailed(format!(
                            "run {} is current; bypass update refused",
                            info.run_id
                        )));
                    }
                }
            }
        }

        let mut record = request.record;
        record.record_version = request.expected_record_version + 1;
        inner.executions.insert(execution_key, record);
        Self::enqueue_tasks(&mut inner, request.shard_id, request.tasks);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<WorkflowExecutionRecord> {
        let inner = self.inner.lock();
        inner
            .executions
            .get(&(
                shard_id,
                domain_id.clone(),
                workflow_id.clone(),
                run_id.clone(),
            ))
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotExists {
                domain_id: domain_id.clone(),
                workflow_id: workflow_id.clone(),
                run_id: run_id.clone(),
            })
    }

    async fn get_current_execution(
        &self,
        shard_id: i32,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
    ) -> EngineResult<CurrentWorkflowRecord> {
        let inner = self.inner.lock();
        inner
            .current
            .get(&(shard_id, domain_id.clone(), workflow_id.clone()))
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotExists {
                domain_id: domain_id.clone(),
                workflow_id: workflow_id.clone(),
                run_id: RunId::from(""),
            })
    }

    async fn delete_workflow_execution(
        &self,
        shard_id: i32,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner.executions.remove(&(
            shard_id,
            domain_id.clone(),
            workflow_id.clone(),
            run_id.clone(),
        ));
        let current_key = (shard_id, domain_id.clone(), workflow_id.clone());
        if inner
            .current
            .get(&current_key)
            .is_some_and(|current| &current.run_id == run_id)
        {
            inner.current.remove(&current_key);
        }
        Ok(())
    }

    async fn get_replication_tasks(
        &self,
        shard_id: i32,
        read_level: i64,
        batch_size: usize,
    ) -> EngineResult<Vec<AllocatedTask<ReplicationTask>>> {
        let inner = self.inner.lock();
        let Some(queues) = inner.queues.get(&shard_id) else {
            return Ok(Vec::new());
        };
        Ok(queues
            .replication
            .range(read_level + 1..)
            .take(batch_size)
            .map(|(&task_id, task)| AllocatedTask {
                task_id,
                task: task.clone(),
            })
            .collect())
    }

    async fn get_timer_tasks(
        &self,
        shard_id: i32,
        max_visibility: DateTime<Utc>,
        batch_size: usize,
    ) -> EngineResult<Vec<AllocatedTask<TimerTask>>> {
        let inner = self.inner.lock();
        let Some(queues) = inner.queues.get(&shard_id) else {
            return Ok(Vec::new());
        };
        Ok(queues
            .timers
            .iter()
            .filter(|allocated| allocated.task.visibility_time() <= max_visibility)
            .take(batch_size)
            .cloned()
            .collect())
    }

    async fn get_transfer_tasks(
        &self,
        shard_id: i32,
        read_level: i64,
        batch_size: usize,
    ) -> EngineResult<Vec<AllocatedTask<TransferTask>>> {
        let inner = self.inner.lock();
        let Some(queues) = inner.queues.get(&shard_id) else {
            return Ok(Vec::new());
        };
        Ok(queues
            .transfer
            .range(read_level + 1..)
            .take(batch_size)
            .map(|(&task_id, task)| AllocatedTask {
                task_id,
                task: task.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn new_branch(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let token = Uuid::new_v4().as_bytes().to_vec();
        inner.branches.insert(
            token.clone(),
            BranchData {
                record: BranchRecord {
                    branch_token: token.clone(),
                    domain_id: domain_id.clone(),
                    workflow_id: workflow_id.clone(),
                    run_id: run_id.clone(),
                    fork_time: Utc::now(),
                },
                events: Vec::new(),
            },
        );
        inner.branch_order.push(token.clone());
        Ok(token)
    }

    async fn append_events(
        &self,
        branch_token: &[u8],
        events: Vec<HistoryEvent>,
    ) -> EngineResult<()> {
        if events.is_empty() {
            return Err(EngineError::BadRequest("empty event batch".into()));
        }
        let mut inner = self.inner.lock();
        let branch = inner
            .branches
            .get_mut(branch_token)
            .ok_or_else(|| EngineError::ConditionFailed("unknown history branch".into()))?;
        let tip = branch.events.last().map(|event| event.event_id).unwrap_or(0);
        let mut expected = tip + 1;
        for event in &events {
            if event.event_id != expected {
                return Err(EngineError::ConditionFailed(format!(
                    "non-contiguous append: expected event {expected}, got {}",
                    event.event_id
                )));
            }
            expected += 1;
        }
        branch.events.extend(events);
        Ok(())
    }

    async fn fork_branch(
        &self,
        branch_token: &[u8],
        fork_event_id: i64,
    ) -> EngineResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let source = inner
            .branches
            .get(branch_token)
            .ok_or_else(|| EngineError::ConditionFailed("unknown history branch".into()))?;
        let prefix: Vec<HistoryEvent> = source
            .events
            .iter()
            .filter(|event| event.event_id <= fork_event_id)
            .cloned()
            .collect();
        let record = source.record.clone();
        let token = Uuid::new_v4().as_bytes().to_vec();
        inner.branches.insert(
            token.clone(),
            BranchData {
                record: BranchRecord {
                    branch_token: token.clone(),
                    fork_time: Utc::now(),
                    ..record
                },
                events: prefix,
            },
        );
        inner.branch_order.push(token.clone());
        Ok(token)
    }

    async fn read_branch(
        &self,
        branch_token: &[u8],
        min_event_id: i64,
        max_event_id: i64,
    ) -> EngineResult<Vec<HistoryEvent>> {
        let inner = self.inner.lock();
        let branch = inner
            .branches
            .get(branch_token)
            .ok_or_else(|| EngineError::ConditionFailed("unknown history branch".into()))?;
        Ok(branch
            .events
            .iter()
            .filter(|event| event.event_id >= min_event_id && event.event_id < max_event_id)
            .cloned()
            .collect())
    }

    async fn get_all_branches(
        &self,
        page_size: usize,
        page_token: Option<Vec<u8>>,
    ) -> EngineResult<BranchPage> {
        let inner = self.inner.lock();
        let start = match page_token {
            None => 0,
            Some(token) => String::from_utf8(token)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| EngineError::BadRequest("bad page token".into()))?,
        };
        let mut branches = Vec::new();
        for token in inner.branch_order.iter().skip(start).take(page_size) {
            if let Some(data) = inner.branches.get(token) {
                branches.push(data.record.clone());
            }
        }
        let consumed = start + page_size;
        let next_page_token = if consumed < inner.branch_order.len() {
            Some(consumed.to_string().into_bytes())
        } else {
            None
        };
        Ok(BranchPage {
            branches,
            next_page_token,
        })
    }

    async fn delete_branch(&self, branch_token: &[u8]) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner.branches.remove(branch_token);
        inner.branch_order.retain(|token| token != branch_token);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn lease_task_list(
        &self,
        name: &str,
        task_type: TaskListType,
        kind: TaskListKind,
    ) -> EngineResult<TaskListInfo> {
        let mut inner = self.inner.lock();
        let state = inner
            .task_lists
            .entry((name.to_string(), task_type))
            .or_insert_with(|| TaskListState {
                info: TaskListInfo {
                    name: name.to_string(),
                    task_type,
                    range_id: 0,
                    ack_level: 0,
                    kind,
                    partition_config: serde_json::Value::Null,
                },
                tasks: BTreeMap::new(),
            });
        state.info.range_id += 1;
        Ok(state.info.clone())
    }

    async fn update_task_list(
        &self,
        info: TaskListInfo,
        expected_range_id: i64,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .task_lists
            .get_mut(&(info.name.clone(), info.task_type))
            .ok_or_else(|| EngineError::ConditionFailed("unknown task list".into()))?;
        if state.info.range_id != expected_range_id {
            return Err(EngineError::TaskListLeaseLost {
                task_list: info.name.clone(),
                held_range_id: expected_range_id,
            });
        }
        state.info = info;
        Ok(())
    }

    async fn create_tasks(
        &self,
        name: &str,
        task_type: TaskListType,
        range_id: i64,
        tasks: Vec<PersistedTask>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .task_lists
            .get_mut(&(name.to_string(), task_type))
            .ok_or_else(|| EngineError::ConditionFailed("unknown task list".into()))?;
        if state.info.range_id != range_id {
            return Err(EngineError::TaskListLeaseLost {
                task_list: name.to_string(),
                held_range_id: range_id,
            });
        }
        for task in tasks {
            state.tasks.insert(task.task_id, task);
        }
        Ok(())
    }

    async fn get_tasks(
        &self,
        name: &str,
        task_type: TaskListType,
        min_exclusive: i64,
        max_inclusive: i64,
        batch_size: usize,
    ) -> EngineResult<Vec<PersistedTask>> {
        let inner = self.inner.lock();
        let Some(state) = inner.task_lists.get(&(name.to_string(), task_type)) else {
            return Ok(Vec::new());
        };
        Ok(state
            .tasks
            .range(min_exclusive + 1..=max_inclusive)
            .take(batch_size)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_tasks_less_than(
        &self,
        name: &str,
        task_type: TaskListType,
        upper_bound: i64,
        limit: usize,
    ) -> EngineResult<usize> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.task_lists.get_mut(&(name.to_string(), task_type)) else {
            return Ok(0);
        };
        let doomed: Vec<i64> = state
            .tasks
            .range(..upper_bound)
            .take(limit)
            .map(|(&task_id, _)| task_id)
            .collect();
        for task_id in &doomed {
            state.tasks.remove(task_id);
        }
        Ok(doomed.len())
    }

    async fn get_task_list_size(
        &self,
        name: &str,
        task_type: TaskListType,
        ack_level: i64,
    ) -> EngineResult<usize> {
        let inner = self.inner.lock();
        let Some(state) = inner.task_lists.get(&(name.to_string(), task_type)) else {
            return Ok(0);
        };
        Ok(state.tasks.range(ack_level + 1..).count())
    }
}
