//! Distributed workflow execution engine
//!
//! This crate implements the core of a multi-cluster workflow service:
//! - Per-shard mutable state machines for long-running workflow executions
//! - Append-only event histories with branching version histories that make
//!   concurrent regional updates linearizable
//! - Passive cross-cluster replication (`sync_activity`,
//!   `replicate_events`) under N-DC conflict-resolution rules
//! - Range-id fenced shards and leased task lists, so at most one writer's
//!   updates ever land
//! - Operational reconciliation: history scavenger, shard fixer, and
//!   lease-based leader election for the shard distributor
//!
//! Storage is an abstract contract with conditional writes; concrete
//! drivers live outside this crate.

pub mod cache;
pub mod config;
pub mod election;
pub mod engine;
pub mod error;
pub mod execution;
pub mod fixer;
pub mod history;
pub mod persistence;
pub mod replication;
pub mod scavenger;
pub mod shard;
pub mod state;
pub mod tasklist;
pub mod tasks;

pub use cache::ExecutionCache;
pub use config::{DynamicConfig, EngineConfig};
pub use engine::{HistoryEngine, StartWorkflowRequest};
pub use error::{EngineError, EngineResult};
pub use execution::{
    CloseStatus, DomainId, EventType, HistoryEvent, RunId, WorkflowId, WorkflowKey,
    WorkflowState,
};
pub use history::{VersionHistories, VersionHistory, VersionHistoryItem};
pub use replication::{ReplicateEventsRequest, SyncActivityRequest};
pub use shard::ShardContext;
pub use state::MutableState;
