//! Shard task queues
//!
//! Every mutable-state flush may enqueue work onto four per-shard queues:
//! transfer (work handed to external subsystems), timer (deadline driven),
//! replication (outbound events to peer clusters) and cross-cluster
//! (inter-region RPC). Task ids are allocated from the shard's leased block
//! at transaction close.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{DomainId, RunId, WorkflowId};

/// Name of a peer cluster
pub type ClusterName = String;

/// Work handed off to external subsystems (matching, archiver, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferTask {
    /// Dispatch an activity to its task list
    ActivityTask {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        task_list: String,
        schedule_id: i64,
    },
    /// Dispatch a decision to its task list
    DecisionTask {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        task_list: String,
        schedule_id: i64,
    },
    /// Run close bookkeeping (visibility, retention timer)
    CloseExecution {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
    },
}

/// Deadline-driven work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimerTask {
    /// Re-dispatch an activity after a retry backoff
    ActivityRetryTimer {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        schedule_id: i64,
        attempt: i32,
        visibility_time: DateTime<Utc>,
    },
    /// Activity schedule-to-start / start-to-close enforcement
    ActivityTimeout {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        schedule_id: i64,
        visibility_time: DateTime<Utc>,
    },
    /// A user timer fired
    UserTimer {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        timer_id: String,
        visibility_time: DateTime<Utc>,
    },
    /// Retention expired; the run's history may be deleted
    DeleteHistory {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        visibility_time: DateTime<Utc>,
    },
}

impl TimerTask {
    /// When the timer becomes due
    pub fn visibility_time(&self) -> DateTime<Utc> {
        match self {
            TimerTask::ActivityRetryTimer {
                visibility_time, ..
            }
            | TimerTask::ActivityTimeout {
                visibility_time, ..
            }
            | TimerTask::UserTimer {
                visibility_time, ..
            }
            | TimerTask::DeleteHistory {
                visibility_time, ..
            } => *visibility_time,
        }
    }
}

/// Outbound replication work, drained by peer clusters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationTask {
    /// A batch of freshly appended history events
    History {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        first_event_id: i64,
        next_event_id: i64,
        version: i64,
        branch_token: Vec<u8>,
    },
    /// Activity progress to reconcile on the passive side
    SyncActivity {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        schedule_id: i64,
        version: i64,
    },
}

/// Inter-region RPC work (cancel/signal across clusters)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossClusterTask {
    pub target_cluster: ClusterName,
    pub task: TransferTask,
}

/// A task with its shard-assigned queue position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedTask<T> {
    pub task_id: i64,
    pub task: T,
}
