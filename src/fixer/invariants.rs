//! Execution invariants
//!
//! Each invariant inspects one scanned execution and either finds it
//! healthy, repairs it, or reports that the repair failed. The fixer runs
//! them as a pipeline and aggregates the outcomes.

use async_trait::async_trait;
use std::sync::Arc;

use super::ScanRecord;
use crate::error::{EngineError, EngineResult};
use crate::execution::{EventType, WorkflowState};
use crate::persistence::{ExecutionStore, HistoryStore};
use crate::shard::shard_for;

/// Verdict of one invariant on one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantVerdict {
    /// Nothing wrong, nothing done
    Healthy,
    /// Corruption found and repaired
    Fixed { note: String },
    /// Corruption found but the repair did not stick
    FixFailed { note: String },
}

/// One check-and-repair rule
#[async_trait]
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check_and_fix(
        &self,
        shard_count: i32,
        record: &ScanRecord,
    ) -> EngineResult<InvariantVerdict>;
}

/// An execution record must have history behind its branch token; one
/// without is debris from an interrupted deletion and gets removed.
pub struct HistoryExists {
    pub execution_store: Arc<dyn ExecutionStore>,
    pub history_store: Arc<dyn HistoryStore>,
}

#[async_trait]
impl Invariant for HistoryExists {
    fn name(&self) -> &'static str {
        "history_exists"
    }

    async fn check_and_fix(
        &self,
        shard_count: i32,
        record: &ScanRecord,
    ) -> EngineResult<InvariantVerdict> {
        let events = match self
            .history_store
            .read_branch(&record.branch_token, 1, 2)
            .await
        {
            Ok(events) => events,
            // Unknown branch: same corruption as an empty one.
            Err(EngineError::ConditionFailed(_)) => Vec::new(),
            Err(err) => return Err(err),
        };
        if !events.is_empty() {
            return Ok(InvariantVerdict::Healthy);
        }
        let shard_id = shard_for(&record.workflow_id, shard_count);
        self.execution_store
            .delete_workflow_execution(
                shard_id,
                &record.domain_id,
                &record.workflow_id,
                &record.run_id,
            )
            .await?;
        Ok(InvariantVerdict::Fixed {
            note: "execution without history removed".into(),
        })
    }
}

/// A branch's first event must be event 1, workflow-execution-started
pub struct ValidFirstEvent {
    pub execution_store: Arc<dyn ExecutionStore>,
    pub history_store: Arc<dyn HistoryStore>,
}

#[async_trait]
impl Invariant for ValidFirstEvent {
    fn name(&self) -> &'static str {
        "valid_first_event"
    }

    async fn check_and_fix(
        &self,
        shard_count: i32,
        record: &ScanRecord,
    ) -> EngineResult<InvariantVerdict> {
        let events = match self
            .history_store
            .read_branch(&record.branch_token, 1, 2)
            .await
        {
            Ok(events) => events,
            // HistoryExists owns the missing-branch case.
            Err(EngineError::ConditionFailed(_)) => return Ok(InvariantVerdict::Healthy),
            Err(err) => return Err(err),
        };
        let Some(first) = events.first() else {
            return Ok(InvariantVerdict::Healthy);
        };
        if first.event_id == 1 && first.event_type == EventType::WorkflowExecutionStarted {
            return Ok(InvariantVerdict::Healthy);
        }
        let shard_id = shard_for(&record.workflow_id, shard_count);
        self.execution_store
            .delete_workflow_execution(
                shard_id,
                &record.domain_id,
                &record.workflow_id,
                &record.run_id,
            )
            .await?;
        self.history_store.delete_branch(&record.branch_token).await?;
        Ok(InvariantVerdict::Fixed {
            note: "execution with corrupt first event removed".into(),
        })
    }
}

/// An open, non-zombie run must be the current run for its workflow id
pub struct OpenCurrentExecution {
    pub execution_store: Arc<dyn ExecutionStore>,
}

#[async_trait]
impl Invariant for OpenCurrentExecution {
    fn name(&self) -> &'static str {
        "open_current_execution"
    }

    async fn check_and_fix(
        &self,
        shard_count: i32,
        record: &ScanRecord,
    ) -> EngineResult<InvariantVerdict> {
        let shard_id = shard_for(&record.workflow_id, shard_count);
        let execution = match self
            .execution_store
            .get_workflow_execution(
                shard_id,
                &record.domain_id,
                &record.workflow_id,
                &record.run_id,
            )
            .await
        {
            Ok(execution) => execution,
            // Deleted by an earlier invariant in this pipeline.
            Err(EngineError::WorkflowNotExists { .. }) => {
                return Ok(InvariantVerdict::Healthy)
            }
            Err(err) => return Err(err),
        };
        let state = execution.execution_info.state;
        if state.is_closed() || state == WorkflowState::Zombie {
            return Ok(InvariantVerdict::Healthy);
        }
        let current = self
            .execution_store
            .get_current_execution(shard_id, &record.domain_id, &record.workflow_id)
            .await;
        let is_current = match current {
            Ok(current) => current.run_id == record.run_id,
            Err(EngineError::WorkflowNotExists { .. }) => false,
            Err(err) => return Err(err),
        };
        if is_current {
            return Ok(InvariantVerdict::Healthy);
        }
        // An open run nothing points at can never make progress again.
        self.execution_store
            .delete_workflow_execution(
                shard_id,
                &record.domain_id,
                &record.workflow_id,
                &record.run_id,
            )
            .await?;
        Ok(InvariantVerdict::Fixed {
            note: "open run without current pointer removed".into(),
        })
    }
}

/// The standard pipeline, in checking order
pub fn default_invariants(
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
) -> Vec<Box<dyn Invariant>> {
    vec![
        Box::new(HistoryExists {
            execution_store: Arc::clone(&execution_store),
            history_store: Arc::clone(&history_store),
        }),
        Box::new(ValidFirstEvent {
            execution_store: Arc::clone(&execution_store),
            history_store,
        }),
        Box::new(OpenCurrentExecution { execution_store }),
    ]
}
