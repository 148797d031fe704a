//! Error types for the execution engine

use thiserror::Error;

use crate::execution::{DomainId, RunId, WorkflowId};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error kinds surfaced by the engine core
#[derive(Error, Debug)]
pub enum EngineError {
    /// A conditional shard write failed because the range id moved on.
    /// Fatal to the current operation; the caller must drop cached state.
    #[error("shard {shard_id} ownership lost: held range id {held_range_id}")]
    ShardOwnershipLost { shard_id: i32, held_range_id: i64 },

    /// Entity absent from persistence
    #[error("workflow does not exist: domain={domain_id} workflow={workflow_id} run={run_id}")]
    WorkflowNotExists {
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
    },

    /// Replication cannot proceed without more events; the sender must
    /// resend the hinted range. Hints are half-open where present.
    #[error("replication retry needed: {message}")]
    RetryTask {
        message: String,
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        start_event_id: Option<i64>,
        start_event_version: Option<i64>,
        end_event_id: Option<i64>,
        end_event_version: Option<i64>,
    },

    /// Task list lease lost to another owner
    #[error("task list {task_list} lease lost: held range id {held_range_id}")]
    TaskListLeaseLost { task_list: String, held_range_id: i64 },

    /// A conditional execution write lost its race; the caller clears the
    /// cached entry and reloads before retrying.
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    /// A run for this workflow id already exists and is current
    #[error("workflow already started: workflow={workflow_id} current run={run_id}")]
    WorkflowAlreadyStarted {
        workflow_id: WorkflowId,
        run_id: RunId,
    },

    /// An internal invariant did not hold; fatal for the operation only
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Version history input is malformed or cannot be compared
    #[error("invalid version history: {0}")]
    InvalidVersionHistory(String),

    /// Malformed or unexpected request input
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Transient persistence or transport failure; the enclosing task
    /// processor retries with backoff, never the state machine.
    #[error("retriable: {0}")]
    Retriable(String),

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// Operation cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Retriable errors are re-enqueued by the task processor; everything
    /// else is terminal for the attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Retriable(_))
    }

    /// Build a retry hint for a sender that must resend events starting at
    /// the given coordinates.
    pub fn retry_task_from(
        message: impl Into<String>,
        domain_id: DomainId,
        workflow_id: WorkflowId,
        run_id: RunId,
        start_event_id: i64,
        start_event_version: i64,
    ) -> Self {
        EngineError::RetryTask {
            message: message.into(),
            domain_id,
            workflow_id,
            run_id,
            start_event_id: Some(start_event_id),
            start_event_version: Some(start_event_version),
            end_event_id: None,
            end_event_version: None,
        }
    }
}
