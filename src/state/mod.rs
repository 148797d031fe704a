//! Mutable state
//!
//! The in-memory view of one run: execution info, pending activities and
//! timers, version histories, and the tasks buffered for the next flush.
//! Mutations come from the active path (local decisions) or the passive
//! path (replicated events); both funnel through a transaction close that
//! validates invariants and produces the conditional persistence write.

pub mod info;

use chrono::Duration;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::execution::{
    DomainId, EventType, HistoryEvent, RunId, WorkflowId, WorkflowState,
};
use crate::history::{VersionHistories, VersionHistory, VersionHistoryItem};
use crate::persistence::{UpdateWorkflowMode, WorkflowExecutionRecord, TaskBatch};
use crate::tasks::{CrossClusterTask, ReplicationTask, TimerTask, TransferTask};
use info::{ActivityInfo, ChildExecutionInfo, ExecutionInfo, TimerInfo};

/// In-memory workflow object for one run
pub struct MutableState {
    pub execution_info: ExecutionInfo,
    pub activity_infos: HashMap<i64, ActivityInfo>,
    pub timer_infos: HashMap<String, TimerInfo>,
    pub child_executions: HashMap<i64, ChildExecutionInfo>,
    pub signal_requested_ids: Vec<String>,
    pub buffered_events: Vec<HistoryEvent>,
    version_histories: Option<VersionHistories>,
    current_version: i64,
    last_write_version: i64,
    /// Optimistic-concurrency token of the loaded record
    record_version: i64,
    // Buffered outputs, drained at transaction close.
    new_events: Vec<HistoryEvent>,
    pending_transfer: Vec<TransferTask>,
    pending_timer: Vec<TimerTask>,
    pending_replication: Vec<ReplicationTask>,
    pending_cross_cluster: Vec<CrossClusterTask>,
}

/// Everything a flush needs: the replacement record, its expected condition,
/// the event batch for the history branch and the tasks to enqueue with it
pub struct StateTransaction {
    pub record: WorkflowExecutionRecord,
    pub expected_record_version: i64,
    pub update_mode: UpdateWorkflowMode,
    pub branch_token: Vec<u8>,
    pub new_events: Vec<HistoryEvent>,
    pub tasks: TaskBatch,
}

impl MutableState {
    /// Fresh state for a run being started locally
    pub fn new_for_start(
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        task_list: String,
        version: i64,
        branch_token: Vec<u8>,
    ) -> Self {
        let histories = VersionHistories::new(VersionHistory::with_branch_token(branch_token));
        Self {
            execution_info: ExecutionInfo::new(domain_id, workflow_id, run_id, task_list),
            activity_infos: HashMap::new(),
            timer_infos: HashMap::new(),
            child_executions: HashMap::new(),
            signal_requested_ids: Vec::new(),
            buffered_events: Vec::new(),
            version_histories: Some(histories),
            current_version: version,
            last_write_version: 0,
            record_version: 0,
            new_events: Vec::new(),
            pending_transfer: Vec::new(),
            pending_timer: Vec::new(),
            pending_replication: Vec::new(),
            pending_cross_cluster: Vec::new(),
        }
    }

    /// Rehydrate from a persisted record, asserting load invariants
    pub fn from_record(record: WorkflowExecutionRecord) -> EngineResult<Self> {
        let state = Self {
            execution_info: record.execution_info,
            activity_infos: record.activity_infos,
            timer_infos: record.timer_infos,
            child_executions: record.child_executions,
            signal_requested_ids: record.signal_requested_ids,
            buffered_events: record.buffered_events,
            version_histories: record.version_histories,
            current_version: record.current_version,
            last_write_version: record.last_write_version,
            record_version: record.record_version,
            new_events: Vec::new(),
            pending_transfer: Vec::new(),
            pending_timer: Vec::new(),
            pending_replication: Vec::new(),
            pending_cross_cluster: Vec::new(),
        };
        state.assert_invariants()?;
        Ok(state)
    }

    pub fn domain_id(&self) -> &DomainId {
        &self.execution_info.domain_id
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.execution_info.workflow_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.execution_info.run_id
    }

    pub fn state(&self) -> WorkflowState {
        self.execution_info.state
    }

    pub fn is_closed(&self) -> bool {
        self.execution_info.state.is_closed()
    }

    pub fn is_zombie(&self) -> bool {
        self.execution_info.state == WorkflowState::Zombie
    }

    /// Mark the run a zombie: alive for replication, not current for its
    /// workflow id
    pub fn set_zombie(&mut self) {
        self.execution_info.state = WorkflowState::Zombie;
    }

    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    pub fn current_version(&self) -> i64 {
        self.current_version
    }

    /// Move to a new failover version (active side, after a domain failover)
    pub fn update_current_version(&mut self, version: i64) {
        self.current_version = version;
    }

    pub fn last_write_version(&self) -> i64 {
        self.last_write_version
    }

    pub fn version_histories(&self) -> Option<&VersionHistories> {
        self.version_histories.as_ref()
    }

    pub fn version_histories_mut(&mut self) -> Option<&mut VersionHistories> {
        self.version_histories.as_mut()
    }

    pub fn activity(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.activity_infos.get(&schedule_id)
    }

    /// Replace an activity's progress record wholesale
    pub fn put_activity(&mut self, activity: ActivityInfo) {
        self.activity_infos.insert(activity.schedule_id, activity);
    }

    pub fn add_timer_task(&mut self, task: TimerTask) {
        self.pending_timer.push(task);
    }

    pub fn add_transfer_task(&mut self, task: TransferTask) {
        self.pending_transfer.push(task);
    }

    pub fn add_replication_task(&mut self, task: ReplicationTask) {
        self.pending_replication.push(task);
    }

    pub fn add_cross_cluster_task(&mut self, task: CrossClusterTask) {
        self.pending_cross_cluster.push(task);
    }

    /// Rough byte footprint for cache eviction accounting
    pub fn estimate_size(&self) -> usize {
        let activities = self.activity_infos.len() * 256;
        let timers = self.timer_infos.len() * 128;
        let children = self.child_executions.len() * 128;
        let buffered: usize = self
            .buffered_events
            .iter()
            .map(|event| 128 + event.attributes.to_string().len())
            .sum();
        let histories = self
            .version_histories
            .as_ref()
            .map(|vh| vh.branch_count() * 64)
            .unwrap_or(0);
        512 + activities + timers + children + buffered + histories
    }

    // ---- active path -----------------------------------------------------

    /// Append locally produced events to the current branch.
    ///
    /// Events are assigned ids here; callers pass event types and
    /// attributes, ordering is the engine's.
    pub fn apply_events(
        &mut self,
        batch: Vec<(EventType, serde_json::Value)>,
    ) -> EngineResult<Vec<HistoryEvent>> {
        if self.is_closed() {
            return Err(EngineError::InvariantViolation(format!(
                "cannot append to closed run {}",
                self.execution_info.run_id
            )));
        }
        if batch.is_empty() {
            return Err(EngineError::BadRequest("empty event batch".into()));
        }
        let first_id = self.execution_info.next_event_id;
        let version = self.current_version;
        let mut events = Vec::with_capacity(batch.len());
        for (offset, (event_type, attributes)) in batch.into_iter().enumerate() {
            let mut event =
                HistoryEvent::new(first_id + offset as i64, version, event_type);
            event.attributes = attributes;
            events.push(event);
        }
        for event in &events {
            self.apply_event_to_derived_state(event)?;
            self.emit_tasks_for_event(event);
        }
        self.execution_info.last_first_event_id = first_id;
        self.execution_info.next_event_id = first_id + events.len() as i64;
        if let Some(histories) = self.version_histories.as_mut() {
            histories.current_mut().update(VersionHistoryItem::new(
                self.execution_info.next_event_id - 1,
                version,
            ))?;
        }
        self.new_events.extend(events.iter().cloned());
        Ok(events)
    }

    // ---- passive path ----------------------------------------------------

    /// Append replicated events onto the current branch. The replication
    /// conflict resolution (append / fork / discard / retry) has already
    /// happened; this only applies.
    pub fn replicate_events(&mut self, events: Vec<HistoryEvent>) -> EngineResult<()> {
        let Some(first) = events.first() else {
            return Err(EngineError::BadRequest("empty replicated batch".into()));
        };
        if first.event_id != self.execution_info.next_event_id {
            return Err(EngineError::InvariantViolation(format!(
                "replicated batch starts at {}, expected {}",
                first.event_id, self.execution_info.next_event_id
            )));
        }
        let first_id = first.event_id;
        for event in &events {
            self.apply_event_to_derived_state(event)?;
            if let Some(histories) = self.version_histories.as_mut() {
                histories
                    .current_mut()
                    .update(VersionHistoryItem::new(event.event_id, event.version))?;
            }
            self.current_version = self.current_version.max(event.version);
            self.last_write_version = self.last_write_version.max(event.version);
        }
        self.execution_info.last_first_event_id = first_id;
        self.execution_info.next_event_id =
            events.last().map(|event| event.event_id + 1).unwrap_or(first_id);
        self.new_events.extend(events);
        Ok(())
    }

    /// Throw away derived state and rebuild it by replaying the shared
    /// prefix of the new current branch. Used after a branch fork.
    pub fn rebuild_from_events(&mut self, events: &[HistoryEvent]) -> EngineResult<()> {
        self.activity_infos.clear();
        self.timer_infos.clear();
        self.child_executions.clear();
        self.signal_requested_ids.clear();
        self.buffered_events.clear();
        self.execution_info.state = WorkflowState::Created;
        self.execution_info.next_event_id = 1;
        self.execution_info.last_first_event_id = 0;
        for event in events {
            if event.event_id != self.execution_info.next_event_id {
                return Err(EngineError::InvariantViolation(format!(
                    "rebuild gap: event {} after {}",
                    event.event_id, self.execution_info.next_event_id
                )));
            }
            self.apply_event_to_derived_state(event)?;
            self.execution_info.next_event_id = event.event_id + 1;
            self.last_write_version = self.last_write_version.max(event.version);
        }
        debug!(
            run_id = %self.execution_info.run_id,
            next_event_id = self.execution_info.next_event_id,
            "derived state rebuilt from branch prefix"
        );
        Ok(())
    }

    // ---- event application ----------------------------------------------

    /// Update the condensed view for one event; shared by the active path,
    /// the passive path and rebuilds.
    fn apply_event_to_derived_state(&mut self, event: &HistoryEvent) -> EngineResult<()> {
        match event.event_type {
            EventType::WorkflowExecutionStarted => {
                self.execution_info.state = WorkflowState::Running;
                self.execution_info.start_time = event.timestamp;
            }
            EventType::ActivityTaskScheduled => {
                let activity_id = attr_str(event, "activity_id")
                    .unwrap_or_else(|| event.event_id.to_string());
                let mut activity =
                    ActivityInfo::new(event.event_id, event.version, activity_id);
                activity.scheduled_time = event.timestamp;
                self.activity_infos.insert(event.event_id, activity);
            }
            EventType::ActivityTaskStarted => {
                let schedule_id = attr_i64(event, "scheduled_event_id").ok_or_else(|| {
                    EngineError::InvariantViolation(format!(
                        "activity started event {} lacks scheduled_event_id",
                        event.event_id
                    ))
                })?;
                if let Some(activity) = self.activity_infos.get_mut(&schedule_id) {
                    activity.started_id = event.event_id;
                    activity.started_time = Some(event.timestamp);
                    activity.version = event.version;
                }
            }
            EventType::ActivityTaskCompleted
            | EventType::ActivityTaskFailed
            | EventType::ActivityTaskTimedOut => {
                if let Some(schedule_id) = attr_i64(event, "scheduled_event_id") {
                    self.activity_infos.remove(&schedule_id);
                }
            }
            EventType::TimerStarted => {
                let timer_id = attr_str(event, "timer_id")
                    .unwrap_or_else(|| event.event_id.to_string());
                let timeout_ms = attr_i64(event, "timeout_ms").unwrap_or(0);
                self.timer_infos.insert(
                    timer_id.clone(),
                    TimerInfo {
                        version: event.version,
                        timer_id,
                        started_id: event.event_id,
                        expiry_time: event.timestamp + Duration::milliseconds(timeout_ms),
                        task_pending: false,
                    },
                );
            }
            EventType::TimerFired | EventType::TimerCanceled => {
                if let Some(timer_id) = attr_str(event, "timer_id") {
                    self.timer_infos.remove(&timer_id);
                }
            }
            EventType::WorkflowExecutionSignaled => {
                if let Some(signal_id) = attr_str(event, "request_id") {
                    self.signal_requested_ids.push(signal_id);
                }
            }
            EventType::DecisionTaskScheduled
            | EventType::DecisionTaskStarted
            | EventType::DecisionTaskTimedOut => {}
            EventType::DecisionTaskCompleted => {
                self.execution_info.last_processed_event = event.event_id;
            }
            _ => {
                if let Some(status) = event.event_type.close_status() {
                    self.execution_info.state = WorkflowState::Closed(status);
                }
            }
        }
        Ok(())
    }

    /// Active-path task emission for one event
    fn emit_tasks_for_event(&mut self, event: &HistoryEvent) {
        let info = &self.execution_info;
        match event.event_type {
            EventType::ActivityTaskScheduled => {
                self.pending_transfer.push(TransferTask::ActivityTask {
                    domain_id: info.domain_id.clone(),
                    workflow_id: info.workflow_id.clone(),
                    run_id: info.run_id.clone(),
                    task_list: attr_str(event, "task_list")
                        .unwrap_or_else(|| info.task_list.clone()),
                    schedule_id: event.event_id,
                });
            }
            EventType::DecisionTaskScheduled => {
                self.pending_transfer.push(TransferTask::DecisionTask {
                    domain_id: info.domain_id.clone(),
                    workflow_id: info.workflow_id.clone(),
                    run_id: info.run_id.clone(),
                    task_list: attr_str(event, "task_list")
                        .unwrap_or_else(|| info.task_list.clone()),
                    schedule_id: event.event_id,
                });
            }
            EventType::TimerStarted => {
                let timeout_ms = attr_i64(event, "timeout_ms").unwrap_or(0);
                self.pending_timer.push(TimerTask::UserTimer {
                    domain_id: info.domain_id.clone(),
                    workflow_id: info.workflow_id.clone(),
                    run_id: info.run_id.clone(),
                    timer_id: attr_str(event, "timer_id")
                        .unwrap_or_else(|| event.event_id.to_string()),
                    visibility_time: event.timestamp + Duration::milliseconds(timeout_ms),
                });
            }
            _ => {
                if event.event_type.close_status().is_some() {
                    self.pending_transfer.push(TransferTask::CloseExecution {
                        domain_id: info.domain_id.clone(),
                        workflow_id: info.workflow_id.clone(),
                        run_id: info.run_id.clone(),
                    });
                }
            }
        }
    }

    // ---- transaction close ----------------------------------------------

    /// Close an active-path transaction: validate, stamp the write version,
    /// and register outbound replication for the appended events.
    pub fn close_transaction_as_active(&mut self) -> EngineResult<StateTransaction> {
        self.assert_invariants()?;
        if !self.new_events.is_empty() {
            let first_id = self.new_events[0].event_id;
            let next_id = self.new_events.last().map(|e| e.event_id + 1).unwrap_or(first_id);
            let branch_token = self.current_branch_token()?;
            self.pending_replication.push(ReplicationTask::History {
                domain_id: self.execution_info.domain_id.clone(),
                workflow_id: self.execution_info.workflow_id.clone(),
                run_id: self.execution_info.run_id.clone(),
                first_event_id: first_id,
                next_event_id: next_id,
                version: self.current_version,
                branch_token,
            });
        }
        self.last_write_version = self.current_version;
        self.finish_transaction()
    }

    /// Close a passive-path transaction: validate and flush, without
    /// producing outbound replication.
    pub fn close_transaction_as_passive(&mut self) -> EngineResult<StateTransaction> {
        self.assert_invariants()?;
        self.finish_transaction()
    }

    fn finish_transaction(&mut self) -> EngineResult<StateTransaction> {
        let update_mode = if self.is_zombie() {
            UpdateWorkflowMode::BypassCurrent
        } else {
            UpdateWorkflowMode::UpdateCurrent
        };
        let branch_token = self.current_branch_token().unwrap_or_default();
        let new_events = std::mem::take(&mut self.new_events);
        let tasks = TaskBatch {
            transfer_tasks: std::mem::take(&mut self.pending_transfer),
            timer_tasks: std::mem::take(&mut self.pending_timer),
            replication_tasks: std::mem::take(&mut self.pending_replication),
            cross_cluster_tasks: std::mem::take(&mut self.pending_cross_cluster),
        };
        let expected_record_version = self.record_version;
        self.record_version += 1;
        Ok(StateTransaction {
            record: self.to_record(),
            expected_record_version,
            update_mode,
            branch_token,
            new_events,
            tasks,
        })
    }

    fn current_branch_token(&self) -> EngineResult<Vec<u8>> {
        let histories = self.version_histories.as_ref().ok_or_else(|| {
            EngineError::InvalidVersionHistory("run has no version histories".into())
        })?;
        Ok(histories.current().branch_token.clone())
    }

    /// Serialized form for persistence
    pub fn to_record(&self) -> WorkflowExecutionRecord {
        WorkflowExecutionRecord {
            execution_info: self.execution_info.clone(),
            activity_infos: self.activity_infos.clone(),
            timer_infos: self.timer_infos.clone(),
            child_executions: self.child_executions.clone(),
            signal_requested_ids: self.signal_requested_ids.clone(),
            buffered_events: self.buffered_events.clone(),
            version_histories: self.version_histories.clone(),
            current_version: self.current_version,
            last_write_version: self.last_write_version,
            record_version: self.record_version,
        }
    }

    /// Invariants checked on load and on every transaction close
    fn assert_invariants(&self) -> EngineResult<()> {
        let next_event_id = self.execution_info.next_event_id;
        if let Some(histories) = &self.version_histories {
            let current = histories.current();
            if !current.is_empty() {
                let tip = current.last_item()?;
                if next_event_id != tip.event_id + 1 {
                    return Err(EngineError::InvariantViolation(format!(
                        "next event id {} does not follow branch tip {}",
                        next_event_id, tip.event_id
                    )));
                }
            }
        }
        for activity in self.activity_infos.values() {
            if activity.schedule_id >= next_event_id {
                return Err(EngineError::InvariantViolation(format!(
                    "pending activity {} beyond next event id {}",
                    activity.schedule_id, next_event_id
                )));
            }
        }
        Ok(())
    }
}

fn attr_str(event: &HistoryEvent, key: &str) -> Option<String> {
    event
        .attributes
        .get(key)
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

fn attr_i64(event: &HistoryEvent, key: &str) -> Option<i64> {
    event.attributes.get(key).and_then(|value| value.as_i64())
}
