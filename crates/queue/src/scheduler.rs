//! Batch scheduler.
//!
//! Jobs are split into batches; up to `max_parallel_batches` batches run at
//! once and each batch runs up to `max_workers_per_batch` jobs at once.
//! Failures get one more attempt from a bounded retry queue after the main
//! pass.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use wp_batch_common::{AppError, AppResult, BatchConfig, Metrics, get_metrics};
use wp_batch_core::{Job, JobStatus, PublishOutcome};

use crate::batch::{Batch, partition};
use crate::checkpoint::{CheckpointWriter, DEFAULT_CHECKPOINT_FILE};
use crate::retry::{DEFAULT_RETRY_CAP, FailedJob};
use crate::stats::{Recorded, RunStats, StatsSnapshot};

/// Shared flag that stops a run before its next batch.
pub type CancellationFlag = Arc<AtomicBool>;

/// Called after every batch with `(completed, total, eta_seconds)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, f64) + Send + Sync>;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub max_parallel_batches: usize,
    pub max_workers_per_batch: usize,
    /// Jobs given a second attempt at most.
    pub retry_queue_cap: usize,
    /// Pause between retries.
    pub retry_delay: Duration,
    /// Checkpoint file; `None` disables checkpoints.
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_parallel_batches: 3,
            max_workers_per_batch: 5,
            retry_queue_cap: DEFAULT_RETRY_CAP,
            retry_delay: Duration::from_secs(1),
            checkpoint_path: Some(PathBuf::from(DEFAULT_CHECKPOINT_FILE)),
        }
    }
}

impl SchedulerConfig {
    /// Build from the batch section of the configuration, applying the
    /// upload mode preset and any explicit overrides.
    #[must_use]
    pub fn from_config(config: &BatchConfig) -> Self {
        let (batch_size, max_parallel_batches, max_workers_per_batch) = config.sizes();
        let defaults = Self::default();
        Self {
            batch_size,
            max_parallel_batches,
            max_workers_per_batch,
            retry_queue_cap: config.retry_queue_cap.unwrap_or(defaults.retry_queue_cap),
            retry_delay: config
                .retry_delay_ms
                .map_or(defaults.retry_delay, Duration::from_millis),
            checkpoint_path: config
                .checkpoint_path
                .clone()
                .or(defaults.checkpoint_path),
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.batch_size == 0 || self.max_parallel_batches == 0 || self.max_workers_per_batch == 0
        {
            return Err(AppError::Scheduler(
                "batch size, parallel batches and workers must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub failed_jobs: Vec<FailedJob>,
    /// Jobs given a second attempt.
    pub retried: usize,
    pub elapsed: Duration,
    pub posts_per_minute: f64,
    /// Whether the run stopped early.
    pub cancelled: bool,
}

/// Everything a batch task needs.
struct RunContext<F> {
    publish: F,
    stats: RunStats,
    workers: usize,
    checkpoint: Option<CheckpointWriter>,
    progress: Option<ProgressReporter>,
    metrics: Arc<Metrics>,
    started: Instant,
}

/// Runs a job list to completion.
pub struct BatchScheduler {
    config: SchedulerConfig,
    progress: Option<ProgressCallback>,
    cancel: Option<CancellationFlag>,
    metrics: Arc<Metrics>,
}

impl BatchScheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            progress: None,
            cancel: None,
            metrics: get_metrics().clone(),
        }
    }

    /// Report progress after every batch.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Stop starting new batches once `flag` is set.
    #[must_use]
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Record into `metrics` instead of the global instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Publish every job.
    ///
    /// Each job ends up counted exactly once, so
    /// `success_count + failed_count == jobs.len()`. Only an invalid
    /// configuration returns an error.
    pub async fn run<F, Fut>(&self, jobs: Vec<Job>, publish: F) -> AppResult<RunReport>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PublishOutcome> + Send + 'static,
    {
        self.config.validate()?;

        let total = jobs.len();
        let originals = jobs.clone();
        let batches = partition(jobs, self.config.batch_size);
        let ctx = Arc::new(RunContext {
            publish,
            stats: RunStats::new(total, self.config.retry_queue_cap),
            workers: self.config.max_workers_per_batch,
            checkpoint: self.config.checkpoint_path.clone().map(CheckpointWriter::new),
            progress: self.progress.clone().map(ProgressReporter::spawn),
            metrics: self.metrics.clone(),
            started: Instant::now(),
        });

        info!(
            total,
            batches = batches.len(),
            batch_size = self.config.batch_size,
            parallel_batches = self.config.max_parallel_batches,
            workers_per_batch = self.config.max_workers_per_batch,
            "Starting batch run"
        );

        let batch_permits = Arc::new(Semaphore::new(self.config.max_parallel_batches));
        let mut running = JoinSet::new();
        let mut cancelled = false;

        for batch in batches {
            let permit = batch_permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Scheduler(e.to_string()))?;

            if cancelled || self.cancelled() {
                if !cancelled {
                    warn!(batch = batch.index, "Run cancelled, skipping remaining batches");
                }
                cancelled = true;
                record_cancelled(&ctx, batch);
                continue;
            }

            let ctx = ctx.clone();
            running.spawn(async move {
                let _permit = permit;
                run_batch(&ctx, batch).await;
            });
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Batch task aborted");
            }
        }

        // Jobs of an aborted batch task were never counted.
        for seq in ctx.stats.uncounted() {
            if let Some(job) = originals.get(seq) {
                let mut job = job.clone();
                job.apply(&PublishOutcome::failed("batch aborted"));
                ctx.stats.increment_final(seq, job, "batch aborted");
                ctx.metrics.record_job(false);
            }
        }

        let retried = self.drain_retries(&ctx).await;

        let snapshot = ctx.stats.snapshot();
        if let Some(writer) = &ctx.checkpoint {
            writer.save_or_warn(&snapshot).await;
        }

        let elapsed = ctx.started.elapsed();
        let success_count = snapshot.succeeded();
        let minutes = elapsed.as_secs_f64() / 60.0;
        let report = RunReport {
            total,
            success_count,
            failed_count: snapshot.failed,
            failed_jobs: ctx.stats.failed_jobs(),
            retried,
            elapsed,
            posts_per_minute: if minutes > 0.0 {
                success_count as f64 / minutes
            } else {
                0.0
            },
            cancelled: cancelled || self.cancelled(),
        };

        info!(
            total,
            succeeded = report.success_count,
            failed = report.failed_count,
            retried,
            elapsed_secs = elapsed.as_secs_f64(),
            posts_per_minute = report.posts_per_minute,
            "Batch run finished"
        );
        Ok(report)
    }

    /// Give each queued job one more attempt, one at a time.
    async fn drain_retries<F, Fut>(&self, ctx: &RunContext<F>) -> usize
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PublishOutcome> + Send + 'static,
    {
        let queued = ctx.stats.take_retry_queue();
        if queued.is_empty() {
            return 0;
        }
        info!(jobs = queued.len(), "Retrying failed jobs");

        let queued_len = queued.len();
        let mut retried = 0;
        for (i, mut job) in queued.into_iter().enumerate() {
            if self.cancelled() {
                warn!(skipped = queued_len - retried, "Run cancelled, skipping retries");
                for _ in retried..queued_len {
                    ctx.metrics.record_job(false);
                }
                break;
            }
            if i > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            ctx.metrics.record_job_retry();
            let outcome = publish_guarded(&ctx.publish, &mut job).await;
            ctx.metrics.record_job(outcome.is_success());
            if outcome.is_success() {
                info!(job_id = %job.id, title = %job.payload.title, "Retry succeeded");
            } else {
                warn!(job_id = %job.id, error = outcome.detail(), "Retry failed");
            }
            ctx.stats.record_retry(job, &outcome);
            retried += 1;
        }
        retried
    }
}

/// Run one batch and report progress when it is done.
async fn run_batch<F, Fut>(ctx: &Arc<RunContext<F>>, batch: Batch)
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PublishOutcome> + Send + 'static,
{
    let index = batch.index;
    let size = batch.len();
    debug!(batch = index, jobs = size, "Batch started");

    let permits = Arc::new(Semaphore::new(ctx.workers));
    let mut workers = JoinSet::new();

    for (pos, mut job) in batch.jobs.into_iter().enumerate() {
        let seq = batch.offset + pos;
        let permits = permits.clone();
        let ctx = ctx.clone();
        workers.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let outcome = publish_guarded(&ctx.publish, &mut job).await;
            record_first_pass(&ctx, seq, job, &outcome);
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(batch = index, error = %e, "Worker task aborted");
        }
    }

    let snapshot = ctx.stats.snapshot();
    info!(
        batch = index,
        jobs = size,
        completed = snapshot.completed,
        total = snapshot.total,
        failed = snapshot.failed,
        "Batch finished"
    );

    if let Some(writer) = &ctx.checkpoint {
        writer.save_or_warn(&snapshot).await;
    }
    report_progress(ctx, &snapshot);
}

/// Publish with panics turned into a failed outcome for this job only.
async fn publish_guarded<F, Fut>(publish: &F, job: &mut Job) -> PublishOutcome
where
    F: Fn(Job) -> Fut,
    Fut: Future<Output = PublishOutcome>,
{
    job.status = JobStatus::InFlight;
    let attempt = job.clone();
    let outcome = match AssertUnwindSafe(async { publish(attempt).await })
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(job_id = %job.id, panic = %message, "Publish panicked");
            PublishOutcome::failed(format!("publish panicked: {message}"))
        }
    };
    job.apply(&outcome);
    outcome
}

fn record_first_pass<F>(ctx: &RunContext<F>, seq: usize, job: Job, outcome: &PublishOutcome) {
    let job_id = job.id.clone();
    match ctx.stats.increment(seq, job, outcome) {
        Recorded::Succeeded => {
            ctx.metrics.record_job(true);
            debug!(job_id = %job_id, locator = outcome.detail(), "Job published");
        }
        Recorded::Queued => {
            warn!(job_id = %job_id, error = outcome.detail(), "Job failed, queued for retry");
        }
        Recorded::Permanent => {
            ctx.metrics.record_job(false);
            warn!(job_id = %job_id, error = outcome.detail(), "Job failed permanently");
        }
        Recorded::Duplicate => {
            error!(job_id = %job_id, "Job result counted twice, ignoring");
        }
    }
}

fn record_cancelled<F>(ctx: &RunContext<F>, batch: Batch) {
    for (pos, mut job) in batch.jobs.into_iter().enumerate() {
        job.status = JobStatus::Failed;
        job.last_error = Some("cancelled".to_string());
        ctx.stats.increment_final(batch.offset + pos, job, "cancelled");
        ctx.metrics.record_job(false);
    }
}

/// Estimated seconds left, extrapolated from the pace so far.
#[must_use]
pub fn eta_seconds(snapshot: &StatsSnapshot, elapsed: Duration) -> f64 {
    if snapshot.completed == 0 {
        return 0.0;
    }
    let per_job = elapsed.as_secs_f64() / snapshot.completed as f64;
    per_job * snapshot.remaining() as f64
}

fn report_progress<F>(ctx: &RunContext<F>, snapshot: &StatsSnapshot) {
    if let Some(reporter) = &ctx.progress {
        reporter.report(
            snapshot.completed,
            snapshot.total,
            eta_seconds(snapshot, ctx.started.elapsed()),
        );
    }
}

/// Runs the progress callback on its own task, in report order.
///
/// Batches finishing together can report out of order; a report behind
/// one already delivered is dropped, so `completed` never goes backwards.
struct ProgressReporter {
    tx: mpsc::UnboundedSender<(usize, usize, f64)>,
}

impl ProgressReporter {
    fn spawn(callback: ProgressCallback) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, usize, f64)>();
        tokio::spawn(async move {
            let mut delivered = 0;
            while let Some((completed, total, eta)) = rx.recv().await {
                if completed < delivered {
                    continue;
                }
                delivered = completed;
                if catch_unwind(AssertUnwindSafe(|| callback(completed, total, eta))).is_err() {
                    warn!(completed, "Progress callback panicked");
                }
            }
        });
        Self { tx }
    }

    fn report(&self, completed: usize, total: usize, eta: f64) {
        if self.tx.send((completed, total, eta)).is_err() {
            debug!(completed, "Progress reporter gone, report dropped");
        }
    }
}
