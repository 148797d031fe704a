//! History scavenger
//!
//! Background reconciliation of the history tree: branches that outlived
//! twice their domain's retention and whose workflow no longer exists are
//! orphans left behind by interrupted deletions, and get removed. The
//! doubled retention window prevents racing the archiver, which deletes
//! mutable state before uploading history. Work is spread over a small
//! worker pool behind a token-bucket rate limit, and progress is
//! heartbeated per page so an enclosing long-running job can be resumed.

use chrono::Utc;
use futures::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::DynamicConfig;
use crate::error::{EngineError, EngineResult};
use crate::persistence::{BranchRecord, ExecutionStore, HistoryStore};
use crate::shard::shard_for;

/// Page size for the history tree scan
const SCAN_PAGE_SIZE: usize = 250;
/// One worker per this many requested ops/s
const RPS_PER_WORKER: i64 = 50;

/// Periodic progress sink so a supervisor can resume the job; tests inject
/// a no-op
pub trait ProgressReporter: Send + Sync {
    fn heartbeat(&self, progress: &ScavengerProgress);
}

/// Reporter that drops progress on the floor
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn heartbeat(&self, _progress: &ScavengerProgress) {}
}

/// Running totals, also the heartbeat payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScavengerProgress {
    pub pages: usize,
    pub scanned: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Final report of one scavenger run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScavengerReport {
    pub progress: ScavengerProgress,
    /// Whether the run was cut short by the stop flag
    pub stopped_early: bool,
}

/// History-tree garbage collector
pub struct HistoryScavenger {
    history_store: Arc<dyn HistoryStore>,
    execution_store: Arc<dyn ExecutionStore>,
    dynamic_config: DynamicConfig,
    shard_count: i32,
}

impl HistoryScavenger {
    pub fn new(
        history_store: Arc<dyn HistoryStore>,
        execution_store: Arc<dyn ExecutionStore>,
        dynamic_config: DynamicConfig,
        shard_count: i32,
    ) -> Self {
        Self {
            history_store,
            execution_store,
            dynamic_config,
            shard_count,
        }
    }

    /// Scan every branch once. Errors on individual branches are counted
    /// and skipped; the caller re-runs the job for another pass.
    pub async fn run(
        &self,
        reporter: &dyn ProgressReporter,
        stop: &AtomicBool,
    ) -> EngineResult<ScavengerReport> {
        let rps = (self.dynamic_config.scavenger_rps)().max(1);
        let workers = (rps / RPS_PER_WORKER + 1) as usize;
        let limiter: Arc<DefaultDirectRateLimiter> = Arc::new(RateLimiter::direct(
            Quota::per_second(NonZeroU32::new(rps as u32).unwrap_or(NonZeroU32::MIN)),
        ));
        info!(rps, workers, "history scavenger starting");

        let (task_tx, task_rx) = mpsc::channel::<BranchRecord>(workers * 2);
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let worker = BranchWorker {
                history_store: Arc::clone(&self.history_store),
                execution_store: Arc::clone(&self.execution_store),
                retention: Arc::clone(&self.dynamic_config.domain_max_retention),
                limiter: Arc::clone(&limiter),
                shard_count: self.shard_count,
            };
            let rx = Arc::clone(&task_rx);
            handles.push(tokio::spawn(async move { worker.drain(rx).await }));
        }

        let mut progress = ScavengerProgress::default();
        let mut page_token = None;
        let mut stopped_early = false;
        loop {
            if stop.load(Ordering::Acquire) {
                stopped_early = true;
                break;
            }
            let page = self
                .history_store
                .get_all_branches(SCAN_PAGE_SIZE, page_token.take())
                .await?;
            progress.pages += 1;
            progress.scanned += page.branches.len();
            for branch in page.branches {
                if task_tx.send(branch).await.is_err() {
                    return Err(EngineError::Internal(
                        "scavenger worker pool shut down early".into(),
                    ));
                }
            }
            reporter.heartbeat(&progress);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        drop(task_tx);

        for joined in join_all(handles).await {
            let outcome = joined
                .map_err(|err| EngineError::Internal(format!("worker panicked: {err}")))?;
            progress.deleted += outcome.deleted;
            progress.skipped += outcome.skipped;
            progress.errors += outcome.errors;
        }
        reporter.heartbeat(&progress);
        metrics::counter!("scavenger_branches_deleted").increment(progress.deleted as u64);
        info!(
            scanned = progress.scanned,
            deleted = progress.deleted,
            skipped = progress.skipped,
            errors = progress.errors,
            "history scavenger finished"
        );
        Ok(ScavengerReport {
            progress,
            stopped_early,
        })
    }
}

#[derive(Default)]
struct WorkerOutcome {
    deleted: usize,
    skipped: usize,
    errors: usize,
}

struct BranchWorker {
    history_store: Arc<dyn HistoryStore>,
    execution_store: Arc<dyn ExecutionStore>,
    retention: crate::config::DomainDurationProperty,
    limiter: Arc<DefaultDirectRateLimiter>,
    shard_count: i32,
}

impl BranchWorker {
    async fn drain(
        self,
        task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BranchRecord>>>,
    ) -> WorkerOutcome {
        let mut outcome = WorkerOutcome::default();
        loop {
            let branch = {
                let mut rx = task_rx.lock().await;
                rx.recv().await
            };
            let Some(branch) = branch else {
                return outcome;
            };
            self.limiter.until_ready().await;
            match self.collect(&branch).await {
                Ok(true) => outcome.deleted += 1,
                Ok(false) => outcome.skipped += 1,
                Err(err) => {
                    outcome.errors += 1;
                    warn!(
                        workflow_id = %branch.workflow_id,
                        run_id = %branch.run_id,
                        error = %err,
                        "scavenger failed on branch"
                    );
                }
            }
        }
    }

    /// Returns whether the branch was deleted
    async fn collect(&self, branch: &BranchRecord) -> EngineResult<bool> {
        // Twice the retention keeps us clear of the archiver, which removes
        // mutable state before it uploads history.
        let threshold = (self.retention)(&branch.domain_id) * 2;
        let age = Utc::now() - branch.fork_time;
        if age < threshold {
            return Ok(false);
        }

        let shard_id = shard_for(&branch.workflow_id, self.shard_count);
        match self
            .execution_store
            .get_workflow_execution(
                shard_id,
                &branch.domain_id,
                &branch.workflow_id,
                &branch.run_id,
            )
            .await
        {
            // Still described by mutable state: not ours to touch.
            Ok(_) => Ok(false),
            Err(EngineError::WorkflowNotExists { .. }) => {
                self.history_store.delete_branch(&branch.branch_token).await?;
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }
}
