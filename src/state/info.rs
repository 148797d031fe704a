//! Condensed per-run records held in mutable state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{DomainId, RunId, WorkflowId, WorkflowState};

/// Queryable summary of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    /// Task list decisions and activities of this run dispatch to
    pub task_list: String,
    /// End-to-end run timeout
    pub execution_timeout: std::time::Duration,
    /// Per decision-task timeout
    pub task_timeout: std::time::Duration,
    pub state: WorkflowState,
    /// Next event id to be assigned on the current branch
    pub next_event_id: i64,
    /// First event id of the most recently appended batch
    pub last_first_event_id: i64,
    /// Highest event id the workflow's decider has processed
    pub last_processed_event: i64,
    pub start_time: DateTime<Utc>,
}

impl ExecutionInfo {
    /// A freshly started run, before its first event batch
    pub fn new(
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        task_list: String,
    ) -> Self {
        Self {
            domain_id,
            workflow_id,
            run_id,
            task_list,
            execution_timeout: std::time::Duration::from_secs(24 * 60 * 60),
            task_timeout: std::time::Duration::from_secs(10),
            state: WorkflowState::Created,
            next_event_id: 1,
            last_first_event_id: 0,
            last_processed_event: 0,
            start_time: Utc::now(),
        }
    }
}

/// Progress of one scheduled activity
///
/// `(version, attempt)` orders concurrent updates across clusters;
/// timestamps are never used for causality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub version: i64,
    pub schedule_id: i64,
    pub scheduled_time: DateTime<Utc>,
    /// Zero until an ActivityTaskStarted event exists
    pub started_id: i64,
    pub started_time: Option<DateTime<Utc>>,
    pub activity_id: String,
    pub attempt: i32,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Opaque progress payload carried by heartbeats
    #[serde(default)]
    pub details: serde_json::Value,
    /// Whether a retry timer task for this activity is already in flight
    pub retry_timer_pending: bool,
}

impl ActivityInfo {
    pub fn new(schedule_id: i64, version: i64, activity_id: String) -> Self {
        Self {
            version,
            schedule_id,
            scheduled_time: Utc::now(),
            started_id: 0,
            started_time: None,
            activity_id,
            attempt: 0,
            last_heartbeat_time: None,
            details: serde_json::Value::Null,
            retry_timer_pending: false,
        }
    }

    /// Lexicographic `(version, attempt)` newness comparison
    pub fn newness(&self) -> (i64, i32) {
        (self.version, self.attempt)
    }
}

/// A user timer pending in the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub version: i64,
    pub timer_id: String,
    pub started_id: i64,
    pub expiry_time: DateTime<Utc>,
    /// Whether a timer task is already in flight
    pub task_pending: bool,
}

/// A child workflow initiated by this run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    pub version: i64,
    pub initiated_id: i64,
    pub started_id: i64,
    pub child_workflow_id: WorkflowId,
    pub child_run_id: Option<RunId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_newness_ordering() {
        let mut a = ActivityInfo::new(5, 100, "act".into());
        let mut b = ActivityInfo::new(5, 100, "act".into());
        a.attempt = 1;
        assert!(a.newness() > b.newness());
        b.version = 101;
        assert!(b.newness() > a.newness());
    }

    #[test]
    fn test_new_execution_info_counters() {
        let info = ExecutionInfo::new("d".into(), "w".into(), "r".into(), "tl".into());
        assert_eq!(info.next_event_id, 1);
        assert_eq!(info.last_first_event_id, 0);
        assert_eq!(info.state, crate::execution::WorkflowState::Created);
    }
}
