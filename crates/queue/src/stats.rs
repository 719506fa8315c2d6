//! Run-wide counters shared by all workers.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use wp_batch_core::{Job, PublishOutcome};

use crate::retry::{FailedJob, RetryQueue};

/// What [`RunStats::increment`] did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Succeeded,
    /// Failed and queued for a retry.
    Queued,
    /// Failed for good: not retryable, or the retry queue was full.
    Permanent,
    /// The job was already counted.
    Duplicate,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatsSnapshot {
    #[must_use]
    pub const fn succeeded(&self) -> usize {
        self.completed.saturating_sub(self.failed)
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

struct State {
    completed: usize,
    counted: Vec<bool>,
    failed_jobs: Vec<FailedJob>,
    retry_queue: RetryQueue,
}

/// Counters for one run.
///
/// Counting, failure bookkeeping and retry queueing for a job happen under
/// one lock, so `completed` moves exactly once per job.
pub struct RunStats {
    total: usize,
    state: Mutex<State>,
}

impl RunStats {
    #[must_use]
    pub fn new(total: usize, retry_cap: usize) -> Self {
        Self {
            total,
            state: Mutex::new(State {
                completed: 0,
                counted: vec![false; total],
                failed_jobs: Vec::new(),
                retry_queue: RetryQueue::new(retry_cap),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the first-pass result of the job at position `seq`.
    pub fn increment(&self, seq: usize, job: Job, outcome: &PublishOutcome) -> Recorded {
        let mut state = self.lock();

        match state.counted.get_mut(seq) {
            Some(counted) if !*counted => *counted = true,
            _ => return Recorded::Duplicate,
        }
        state.completed += 1;

        let PublishOutcome::Failed { error, .. } = outcome else {
            return Recorded::Succeeded;
        };

        state.failed_jobs.push(FailedJob::new(job.clone(), error.clone()));
        if outcome.is_retryable() && state.retry_queue.push(job) {
            Recorded::Queued
        } else {
            Recorded::Permanent
        }
    }

    /// Count the job at `seq` as failed without queueing it for a retry.
    pub fn increment_final(&self, seq: usize, job: Job, error: &str) -> Recorded {
        let mut state = self.lock();

        match state.counted.get_mut(seq) {
            Some(counted) if !*counted => *counted = true,
            _ => return Recorded::Duplicate,
        }
        state.completed += 1;
        state.failed_jobs.push(FailedJob::new(job, error));
        Recorded::Permanent
    }

    /// Positions that were never counted.
    #[must_use]
    pub fn uncounted(&self) -> Vec<usize> {
        self.lock()
            .counted
            .iter()
            .enumerate()
            .filter_map(|(seq, counted)| (!counted).then_some(seq))
            .collect()
    }

    /// Take the jobs waiting for a retry.
    pub fn take_retry_queue(&self) -> Vec<Job> {
        self.lock().retry_queue.drain()
    }

    /// Apply the result of a job's retry.
    pub fn record_retry(&self, job: Job, outcome: &PublishOutcome) {
        let mut state = self.lock();
        let position = state.failed_jobs.iter().position(|f| f.job.id == job.id);

        match (outcome, position) {
            (PublishOutcome::Published { .. }, Some(pos)) => {
                state.failed_jobs.remove(pos);
            }
            (PublishOutcome::Failed { error, .. }, Some(pos)) => {
                state.failed_jobs[pos] = FailedJob::new(job, error.clone());
            }
            (_, None) => {}
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.lock();
        StatsSnapshot {
            total: self.total,
            completed: state.completed,
            failed: state.failed_jobs.len(),
        }
    }

    /// Jobs that have failed so far.
    #[must_use]
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.lock().failed_jobs.clone()
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wp_batch_transport::{ErrorKind, PostDraft};

    fn job(n: usize) -> Job {
        Job::new(format!("job-{n}"), PostDraft::new(format!("Post {n}"), ""))
    }

    fn ok() -> PublishOutcome {
        PublishOutcome::Published {
            locator: "https://blog.test/?p=1".to_string(),
            stage: "rest",
        }
    }

    fn throttled() -> PublishOutcome {
        PublishOutcome::Failed {
            error: "rate limited".to_string(),
            kind: Some(ErrorKind::RateLimited),
        }
    }

    #[test]
    fn test_increment_counts_once() {
        let stats = RunStats::new(2, 10);

        assert_eq!(stats.increment(0, job(0), &ok()), Recorded::Succeeded);
        assert_eq!(stats.increment(0, job(0), &ok()), Recorded::Duplicate);
        assert_eq!(stats.increment(7, job(7), &ok()), Recorded::Duplicate);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.remaining(), 1);
        assert_eq!(stats.uncounted(), vec![1]);
    }

    #[test]
    fn test_failures_queue_until_cap() {
        let stats = RunStats::new(4, 2);

        assert_eq!(stats.increment(0, job(0), &throttled()), Recorded::Queued);
        assert_eq!(stats.increment(1, job(1), &throttled()), Recorded::Queued);
        assert_eq!(stats.increment(2, job(2), &throttled()), Recorded::Permanent);

        let rejected = PublishOutcome::Failed {
            error: "bad".to_string(),
            kind: Some(ErrorKind::PermanentClient),
        };
        assert_eq!(stats.increment(3, job(3), &rejected), Recorded::Permanent);

        assert_eq!(stats.snapshot().failed, 4);
        assert_eq!(stats.take_retry_queue().len(), 2);
        assert!(stats.take_retry_queue().is_empty());
    }

    #[test]
    fn test_final_failure_skips_queue() {
        let stats = RunStats::new(1, 10);
        assert_eq!(stats.increment_final(0, job(0), "cancelled"), Recorded::Permanent);
        assert_eq!(stats.increment_final(0, job(0), "cancelled"), Recorded::Duplicate);
        assert!(stats.take_retry_queue().is_empty());
        assert_eq!(stats.failed_jobs()[0].error, "cancelled");
    }

    #[test]
    fn test_retry_success_clears_failure() {
        let stats = RunStats::new(2, 10);
        stats.increment(0, job(0), &throttled());
        stats.increment(1, job(1), &throttled());

        let mut queued = stats.take_retry_queue();
        stats.record_retry(queued.remove(0), &ok());
        stats.record_retry(queued.remove(0), &PublishOutcome::failed("still down"));

        let failed = stats.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.id, "job-1");
        assert_eq!(failed[0].error, "still down");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.succeeded() + snapshot.failed, snapshot.total);
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(RunStats::new(400, 10));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let seq = t * 100 + i;
                        let outcome = if seq % 3 == 0 { throttled() } else { ok() };
                        stats.increment(seq, job(seq), &outcome);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 400);
        assert_eq!(snapshot.failed, 134);
        assert!(stats.uncounted().is_empty());
    }
}
