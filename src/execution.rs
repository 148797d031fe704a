//! Workflow execution identity and event model
//!
//! A run is addressed by the `(domain, workflow, run)` triple. Multiple
//! sequential runs may exist for one workflow id; exactly one of them is
//! "current" at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Domain (namespace) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(pub String);

/// User-chosen workflow identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

/// Identifier of one attempt at a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a fresh run id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

macro_rules! string_id {
    ($ty:ident) => {
        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $ty {
            /// String view of the identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(DomainId);
string_id!(WorkflowId);
string_id!(RunId);

/// Full address of a run; the execution cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
}

impl WorkflowKey {
    pub fn new(domain_id: DomainId, workflow_id: WorkflowId, run_id: RunId) -> Self {
        Self {
            domain_id,
            workflow_id,
            run_id,
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
    }
}

/// Lifecycle state of a run
///
/// A zombie run exists for replication purposes but is not the current run
/// for its workflow id. The persistence write mode is derived from this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    /// Run record created, first decision not yet scheduled
    Created,
    /// Run is making progress
    Running,
    /// Replicated run that is not current for its workflow id
    Zombie,
    /// Run reached a terminal event
    Closed(CloseStatus),
}

impl WorkflowState {
    /// Whether the run has reached a terminal event
    pub fn is_closed(&self) -> bool {
        matches!(self, WorkflowState::Closed(_))
    }

    /// Close status, `None` while the run is open
    pub fn close_status(&self) -> Option<CloseStatus> {
        match self {
            WorkflowState::Closed(status) => Some(*status),
            _ => None,
        }
    }
}

/// Reason a run closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

/// Kind of a history event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionTimedOut,
    WorkflowExecutionSignaled,
    DecisionTaskScheduled,
    DecisionTaskStarted,
    DecisionTaskCompleted,
    DecisionTaskTimedOut,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    TimerStarted,
    TimerFired,
    TimerCanceled,
}

impl EventType {
    /// Event types that close the run, paired with their close status
    pub fn close_status(&self) -> Option<CloseStatus> {
        match self {
            EventType::WorkflowExecutionCompleted => Some(CloseStatus::Completed),
            EventType::WorkflowExecutionFailed => Some(CloseStatus::Failed),
            EventType::WorkflowExecutionCanceled => Some(CloseStatus::Canceled),
            EventType::WorkflowExecutionTerminated => Some(CloseStatus::Terminated),
            EventType::WorkflowExecutionContinuedAsNew => Some(CloseStatus::ContinuedAsNew),
            EventType::WorkflowExecutionTimedOut => Some(CloseStatus::TimedOut),
            _ => None,
        }
    }
}

/// One entry of a run's append-only history
///
/// Event ids are 1-based and dense within a run. `version` is the failover
/// era of the cluster that produced the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    /// Type-specific payload; opaque to the replication machinery
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl HistoryEvent {
    pub fn new(event_id: i64, version: i64, event_type: EventType) -> Self {
        Self {
            event_id,
            version,
            timestamp: Utc::now(),
            event_type,
            attributes: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_close_status() {
        assert!(!WorkflowState::Running.is_closed());
        assert!(WorkflowState::Closed(CloseStatus::Completed).is_closed());
        assert_eq!(WorkflowState::Zombie.close_status(), None);
        assert_eq!(
            WorkflowState::Closed(CloseStatus::TimedOut).close_status(),
            Some(CloseStatus::TimedOut)
        );
    }

    #[test]
    fn test_terminal_event_mapping() {
        assert_eq!(
            EventType::WorkflowExecutionContinuedAsNew.close_status(),
            Some(CloseStatus::ContinuedAsNew)
        );
        assert_eq!(EventType::ActivityTaskStarted.close_status(), None);
    }

    #[test]
    fn test_workflow_key_display() {
        let key = WorkflowKey::new("dom".into(), "wf".into(), "run".into());
        assert_eq!(key.to_string(), "dom/wf/run");
    }
}
