//! Passive event replication
//!
//! Applies a peer cluster's event batches. The incoming version history is
//! compared against every local branch: a batch either extends the current
//! branch (append), proves a newer failover era (fork a branch from the
//! deepest shared prefix and make it current), is already covered locally
//! (discard), or cannot be placed without more events (retry hint back to
//! the sender).

use std::sync::Arc;
use tracing::{debug, info};

use super::{ensure_loaded, persist_passive_transaction, NewRunEvents, ReplicateEventsRequest};
use crate::cache::ExecutionCache;
use crate::error::{EngineError, EngineResult};
use crate::execution::{DomainId, EventType, HistoryEvent, RunId, WorkflowId, WorkflowKey};
use crate::history::{VersionHistory, VersionHistoryItem};
use crate::persistence::{
    CreateWorkflowMode, CreateWorkflowRequest, HistoryStore,
};
use crate::shard::ShardContext;
use crate::state::MutableState;

/// Placement of an incoming batch relative to local branches
enum EventsDecision {
    /// Extends the current branch in place
    Append,
    /// A newer era diverged below the current tip: fork and switch
    Fork {
        source_index: usize,
        source_token: Vec<u8>,
        lca: VersionHistoryItem,
    },
    /// Every incoming event is already on a local branch
    Discard,
    /// Cannot be placed; the sender must resend from the hinted item
    Retry(VersionHistoryItem),
}

/// Applies `replicate_events` requests on the passive side
pub struct EventsReplicator {
    shard: Arc<ShardContext>,
    cache: Arc<ExecutionCache<MutableState>>,
    history_store: Arc<dyn HistoryStore>,
}

impl EventsReplicator {
    pub fn new(
        shard: Arc<ShardContext>,
        cache: Arc<ExecutionCache<MutableState>>,
        history_store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            shard,
            cache,
            history_store,
        }
    }

    /// Apply one replicated batch, creating the run if this is its first
    /// batch. Re-delivery of an applied batch is an idempotent success.
    pub async fn replicate_events(&self, request: ReplicateEventsRequest) -> EngineResult<()> {
        let Some(first) = request.events.first().cloned() else {
            return Err(EngineError::BadRequest("empty replicated batch".into()));
        };
        if request.version_history_items.is_empty() {
            return Err(EngineError::BadRequest(
                "replicated batch lacks a version history".into(),
            ));
        }

        let key = WorkflowKey::new(
            request.domain_id.clone(),
            request.workflow_id.clone(),
            request.run_id.clone(),
        );
        let context = self.cache.get_or_create(&key);
        let mut guard = context.lock().await;

        if !ensure_loaded(
            &self.shard,
            &mut guard,
            &request.domain_id,
            &request.workflow_id,
            &request.run_id,
        )
        .await?
        {
            if first.event_id != 1 {
                metrics::counter!("replicate_events_retry").increment(1);
                return Err(EngineError::RetryTask {
                    message: "run unknown locally; resend from the first event".into(),
                    domain_id: request.domain_id,
                    workflow_id: request.workflow_id,
                    run_id: request.run_id,
                    start_event_id: None,
                    start_event_version: None,
                    end_event_id: Some(first.event_id),
                    end_event_version: Some(first.version),
                });
            }
            let state = self
                .create_run(
                    &request.domain_id,
                    &request.workflow_id,
                    &request.run_id,
                    request.events.clone(),
                )
                .await?;
            let size = state.estimate_size();
            let last_write_version = state.last_write_version();
            guard.install(state, size);
            drop(guard);
            self.maybe_apply_new_run(&request, last_write_version).await?;
            metrics::counter!("replicate_events_applied").increment(1);
            return Ok(());
        }

        let incoming =
            VersionHistory::new(Vec::new(), request.version_history_items.clone())?;

        let decision = {
            let state = guard.state().ok_or_else(|| {
                EngineError::Internal("mutable state vanished under lock".into())
            })?;
            self.place_batch(state, &incoming, &first)?
        };

        match decision {
            EventsDecision::Discard => {
                metrics::counter!("replicate_events_noop").increment(1);
                return Ok(());
            }
            EventsDecision::Retry(resend_from) => {
                metrics::counter!("replicate_events_retry").increment(1);
                return Err(EngineError::retry_task_from(
                    "events missing locally",
                    request.domain_id,
                    request.workflow_id,
                    request.run_id,
                    resend_from.event_id,
                    resend_from.version,
                ));
            }
            EventsDecision::Append => {
                let state = guard.state_mut().ok_or_else(|| {
                    EngineError::Internal("mutable state vanished under lock".into())
                })?;
                state.replicate_events(request.events.clone())?;
            }
            EventsDecision::Fork {
                source_index,
                source_token,
                lca,
            } => {
                let new_token = self
                    .history_store
                    .fork_branch(&source_token, lca.event_id)
                    .await?;
                let prefix = self
                    .history_store
                    .read_branch(&new_token, 1, lca.event_id + 1)
                    .await?;
                let state = guard.state_mut().ok_or_else(|| {
                    EngineError::Internal("mutable state vanished under lock".into())
                })?;
                let histories = state.version_histories_mut().ok_or_else(|| {
                    EngineError::InvalidVersionHistory("run has no version histories".into())
                })?;
                let mut forked = histories.history(source_index)?.duplicate_until(lca)?;
                forked.branch_token = new_token;
                let new_index = histories.add_history(forked)?;
                histories.set_current_index(new_index)?;
                info!(
                    workflow_id = %request.workflow_id,
                    run_id = %request.run_id,
                    lca_event_id = lca.event_id,
                    lca_version = lca.version,
                    "forked history branch for newer failover era"
                );
                state.rebuild_from_events(&prefix)?;
                state.replicate_events(request.events.clone())?;
            }
        }

        let last_write_version = {
            let state = guard.state_mut().ok_or_else(|| {
                EngineError::Internal("mutable state vanished under lock".into())
            })?;
            let transaction = state.close_transaction_as_passive()?;
            let version = state.last_write_version();
            persist_passive_transaction(
                &self.shard,
                self.history_store.as_ref(),
                &mut guard,
                transaction,
            )
            .await?;
            version
        };
        drop(guard);
        self.maybe_apply_new_run(&request, last_write_version).await?;
        metrics::counter!("replicate_events_applied").increment(1);
        Ok(())
    }

    /// Decide how the batch lands relative to local branches
    fn place_batch(
        &self,
        state: &MutableState,
        incoming: &VersionHistory,
        first: &HistoryEvent,
    ) -> EngineResult<EventsDecision> {
        let histories = state.version_histories().ok_or_else(|| {
            EngineError::BadRequest("run predates version histories".into())
        })?;
        let incoming_tip = incoming.last_item()?;

        if histories.find_branch_containing(incoming_tip).is_some() {
            return Ok(EventsDecision::Discard);
        }

        let current = histories.current();
        let current_tip = current.last_item()?;
        let lca_current = current.lowest_common_item(incoming)?;

        if lca_current == current_tip {
            // Nothing local beyond the shared prefix: a pure extension.
            if first.event_id != current_tip.event_id + 1 {
                return Ok(EventsDecision::Retry(current_tip));
            }
            return Ok(EventsDecision::Append);
        }

        if incoming_tip.version > current_tip.version {
            // The incoming lineage won a later failover; rebase onto the
            // deepest shared prefix across all branches.
            let (source_index, lca) = histories.find_lca(incoming)?;
            if first.event_id != lca.event_id + 1 {
                return Ok(EventsDecision::Retry(lca));
            }
            let source_token = histories.history(source_index)?.branch_token.clone();
            return Ok(EventsDecision::Fork {
                source_index,
                source_token,
                lca,
            });
        }

        // The incoming lineage lost to the local one but is not contained
        // either; the sender must reconcile from the divergence point.
        Ok(EventsDecision::Retry(lca_current))
    }

    /// Build and persist a brand-new replicated run from its first batch
    async fn create_run(
        &self,
        domain_id: &DomainId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        events: Vec<HistoryEvent>,
    ) -> EngineResult<MutableState> {
        let version = events.first().map(|event| event.version).unwrap_or(0);
        let task_list = events
            .first()
            .and_then(|event| event.attributes.get("task_list"))
            .and_then(|value| value.as_str())
            .unwrap_or("default")
            .to_string();

        // Zombie when an open run already owns the workflow id.
        let current = self
            .shard
            .execution_store()
            .get_current_execution(self.shard.shard_id(), domain_id, workflow_id)
            .await;
        let as_zombie = match current {
            Ok(current) => &current.run_id != run_id && !current.state.is_closed(),
            Err(EngineError::WorkflowNotExists { .. }) => false,
            Err(err) => return Err(err),
        };

        let branch_token = self
            .history_store
            .new_branch(domain_id, workflow_id, run_id)
            .await?;
        let mut state = MutableState::new_for_start(
            domain_id.clone(),
            workflow_id.clone(),
            run_id.clone(),
            task_list,
            version,
            branch_token,
        );
        state.replicate_events(events)?;
        if as_zombie {
            state.set_zombie();
            debug!(
                workflow_id = %workflow_id,
                run_id = %run_id,
                "creating replicated run as zombie"
            );
        }
        let transaction = state.close_transaction_as_passive()?;
        self.history_store
            .append_events(&transaction.branch_token, transaction.new_events)
            .await?;
        let mode = if as_zombie {
            CreateWorkflowMode::BypassCurrent
        } else {
            CreateWorkflowMode::UpdateCurrent
        };
        self.shard
            .create_workflow_execution(CreateWorkflowRequest {
                shard_id: self.shard.shard_id(),
                range_id: self.shard.range_id(),
                mode,
                record: transaction.record,
                tasks: transaction.tasks,
            })
            .await?;
        Ok(state)
    }

    /// Continued-as-new successors ride along with the closing batch; the
    /// new run replaces the current pointer that the closed run held.
    async fn maybe_apply_new_run(
        &self,
        request: &ReplicateEventsRequest,
        prev_last_write_version: i64,
    ) -> EngineResult<()> {
        let Some(NewRunEvents { run_id, events }) = &request.new_run_events else {
            return Ok(());
        };
        let continued = request
            .events
            .last()
            .map(|event| event.event_type == EventType::WorkflowExecutionContinuedAsNew)
            .unwrap_or(false);
        if !continued {
            return Err(EngineError::BadRequest(
                "new-run events without a continued-as-new close".into(),
            ));
        }
        let Some(first) = events.first() else {
            return Err(EngineError::BadRequest("empty new-run batch".into()));
        };
        if first.event_id != 1 {
            return Err(EngineError::BadRequest(
                "new-run batch must start at event 1".into(),
            ));
        }

        let key = WorkflowKey::new(
            request.domain_id.clone(),
            request.workflow_id.clone(),
            run_id.clone(),
        );
        let context = self.cache.get_or_create(&key);
        let mut guard = context.lock().await;
        if ensure_loaded(
            &self.shard,
            &mut guard,
            &request.domain_id,
            &request.workflow_id,
            run_id,
        )
        .await?
        {
            // Successor already replicated.
            return Ok(());
        }

        let version = first.version;
        let branch_token = self
            .history_store
            .new_branch(&request.domain_id, &request.workflow_id, run_id)
            .await?;
        let mut state = MutableState::new_for_start(
            request.domain_id.clone(),
            request.workflow_id.clone(),
            run_id.clone(),
            "default".to_string(),
            version,
            branch_token,
        );
        state.replicate_events(events.clone())?;
        let transaction = state.close_transaction_as_passive()?;
        self.history_store
            .append_events(&transaction.branch_token, transaction.new_events)
            .await?;
        self.shard
            .create_workflow_execution(CreateWorkflowRequest {
                shard_id: self.shard.shard_id(),
                range_id: self.shard.range_id(),
                mode: CreateWorkflowMode::ContinueAsNew {
                    prev_run_id: request.run_id.clone(),
                    prev_last_write_version,
                },
                record: transaction.record,
                tasks: transaction.tasks,
            })
            .await?;
        let size = state.estimate_size();
        guard.install(state, size);
        Ok(())
    }
}
