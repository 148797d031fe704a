//! Shard fixer
//!
//! Consumes a per-shard stream of scan records produced by an upstream
//! scanner, runs each through the invariant pipeline and serializes the
//! aggregated outcome onto one of three buffered result streams (fixed,
//! skipped, failed). Control-flow failures (iterator read, writer add,
//! flush) end the shard immediately: the failure is recorded on the report,
//! the per-domain statistics gathered so far are kept as they are, and the
//! caller re-runs the shard instead of retrying here.

pub mod invariants;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::config::DomainBoolProperty;
use crate::error::EngineResult;
use crate::execution::{DomainId, RunId, WorkflowId};
use invariants::{Invariant, InvariantVerdict};

/// One record of the upstream scanner's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub domain_id: DomainId,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub branch_token: Vec<u8>,
}

/// Aggregated pipeline outcome for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixOutcome {
    Fixed,
    Skipped,
    Failed,
}

/// Line written to a result stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixResultEntry {
    pub record: ScanRecord,
    pub outcome: FixOutcome,
    /// Invariant that decided the outcome, when one did
    pub invariant: Option<String>,
    pub note: Option<String>,
}

/// Source of scan records for one shard
#[async_trait]
pub trait ScanInputIterator: Send {
    /// `None` when the stream is exhausted
    async fn next(&mut self) -> Option<EngineResult<ScanRecord>>;
}

/// Iterator over pre-collected records; the tooling shape for tests and
/// replays
pub struct VecScanIterator {
    records: VecDeque<EngineResult<ScanRecord>>,
}

impl VecScanIterator {
    pub fn new(records: Vec<EngineResult<ScanRecord>>) -> Self {
        Self {
            records: records.into(),
        }
    }
}

#[async_trait]
impl ScanInputIterator for VecScanIterator {
    async fn next(&mut self) -> Option<EngineResult<ScanRecord>> {
        self.records.pop_front()
    }
}

/// Buffered sink for one result stream
#[async_trait]
pub trait FixResultWriter: Send {
    async fn add(&mut self, entry: FixResultEntry) -> EngineResult<()>;

    /// Push everything buffered to the backing store
    async fn flush(&mut self) -> EngineResult<()>;
}

/// Writer that buffers entries and flushes them in bulk into memory; the
/// production sink swaps the flush target for blob storage
#[derive(Default)]
pub struct BufferedResultWriter {
    buffer: Vec<FixResultEntry>,
    flushed: Vec<FixResultEntry>,
}

impl BufferedResultWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries that reached the backing store
    pub fn flushed(&self) -> &[FixResultEntry] {
        &self.flushed
    }
}

#[async_trait]
impl FixResultWriter for BufferedResultWriter {
    async fn add(&mut self, entry: FixResultEntry) -> EngineResult<()> {
        self.buffer.push(entry);
        Ok(())
    }

    async fn flush(&mut self) -> EngineResult<()> {
        self.flushed.append(&mut self.buffer);
        Ok(())
    }
}

/// Which result stream an operation was against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStream {
    Fixed,
    Skipped,
    Failed,
}

/// Why a shard's fix run ended early
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlFlowFailure {
    IteratorError { message: String },
    WriterAddError { stream: ResultStream, message: String },
    FlushError { stream: ResultStream, message: String },
}

/// Outcome tallies, kept per shard and per domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixStats {
    pub entities: usize,
    pub fixed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl FixStats {
    fn record(&mut self, outcome: FixOutcome) {
        self.entities += 1;
        match outcome {
            FixOutcome::Fixed => self.fixed += 1,
            FixOutcome::Skipped => self.skipped += 1,
            FixOutcome::Failed => self.failed += 1,
        }
    }
}

/// Report for one shard's fix run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardFixReport {
    pub shard_id: i32,
    pub stats: FixStats,
    pub domain_stats: HashMap<DomainId, FixStats>,
    /// Set when the run ended on a control-flow failure; the stats above
    /// cover only what was processed before it
    pub failure: Option<ControlFlowFailure>,
}

/// The three output streams of a fix run
pub struct FixerWriters<'a> {
    pub fixed: &'a mut dyn FixResultWriter,
    pub skipped: &'a mut dyn FixResultWriter,
    pub failed: &'a mut dyn FixResultWriter,
}

/// Runs the invariant pipeline over one shard's scan output
pub struct ShardFixer {
    shard_count: i32,
    invariants: Vec<Box<dyn Invariant>>,
    domain_allowlist: DomainBoolProperty,
}

impl ShardFixer {
    pub fn new(
        shard_count: i32,
        invariants: Vec<Box<dyn Invariant>>,
        domain_allowlist: DomainBoolProperty,
    ) -> Self {
        Self {
            shard_count,
            invariants,
            domain_allowlist,
        }
    }

    /// Process the whole stream. Never retries: any control-flow failure is
    /// recorded on the report and the caller re-runs the shard.
    pub async fn fix_shard(
        &self,
        shard_id: i32,
        iterator: &mut dyn ScanInputIterator,
        writers: &mut FixerWriters<'_>,
    ) -> ShardFixReport {
        let mut report = ShardFixReport {
            shard_id,
            ..ShardFixReport::default()
        };

        while let Some(read) = iterator.next().await {
            let record = match read {
                Ok(record) => record,
                Err(err) => {
                    report.failure = Some(ControlFlowFailure::IteratorError {
                        message: err.to_string(),
                    });
                    return report;
                }
            };

            let (outcome, invariant, note) = if (self.domain_allowlist)(&record.domain_id) {
                self.run_pipeline(&record).await
            } else {
                (FixOutcome::Skipped, None, Some("domain not allowlisted".into()))
            };

            report.stats.record(outcome);
            report
                .domain_stats
                .entry(record.domain_id.clone())
                .or_default()
                .record(outcome);
            metrics::counter!("fixer_entities", "outcome" => outcome_label(outcome))
                .increment(1);

            let entry = FixResultEntry {
                record,
                outcome,
                invariant,
                note,
            };
            let (writer, stream) = match outcome {
                FixOutcome::Fixed => (&mut *writers.fixed, ResultStream::Fixed),
                FixOutcome::Skipped => (&mut *writers.skipped, ResultStream::Skipped),
                FixOutcome::Failed => (&mut *writers.failed, ResultStream::Failed),
            };
            if let Err(err) = writer.add(entry).await {
                report.failure = Some(ControlFlowFailure::WriterAddError {
                    stream,
                    message: err.to_string(),
                });
                return report;
            }
        }

        for (writer, stream) in [
            (&mut *writers.fixed, ResultStream::Fixed),
            (&mut *writers.skipped, ResultStream::Skipped),
            (&mut *writers.failed, ResultStream::Failed),
        ] {
            if let Err(err) = writer.flush().await {
                report.failure = Some(ControlFlowFailure::FlushError {
                    stream,
                    message: err.to_string(),
                });
                return report;
            }
        }
        report
    }

    /// Run invariants in order; the first non-healthy verdict decides
    async fn run_pipeline(
        &self,
        record: &ScanRecord,
    ) -> (FixOutcome, Option<String>, Option<String>) {
        for invariant in &self.invariants {
            match invariant.check_and_fix(self.shard_count, record).await {
                Ok(InvariantVerdict::Healthy) => continue,
                Ok(InvariantVerdict::Fixed { note }) => {
                    return (
                        FixOutcome::Fixed,
                        Some(invariant.name().to_string()),
                        Some(note),
                    )
                }
                Ok(InvariantVerdict::FixFailed { note }) => {
                    return (
                        FixOutcome::Failed,
                        Some(invariant.name().to_string()),
                        Some(note),
                    )
                }
                Err(err) => {
                    return (
                        FixOutcome::Failed,
                        Some(invariant.name().to_string()),
                        Some(err.to_string()),
                    )
                }
            }
        }
        (FixOutcome::Skipped, None, None)
    }
}

fn outcome_label(outcome: FixOutcome) -> &'static str {
    match outcome {
        FixOutcome::Fixed => "fixed",
        FixOutcome::Skipped => "skipped",
        FixOutcome::Failed => "failed",
    }
}
