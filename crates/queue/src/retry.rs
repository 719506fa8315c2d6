//! Bounded retry queue and failure records.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use wp_batch_core::Job;

/// Default number of jobs given a second pass.
pub const DEFAULT_RETRY_CAP: usize = 10;

/// A job that has failed, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    /// The failed job.
    pub job: Job,
    /// Last error message.
    pub error: String,
    /// Timestamp of last failure.
    pub failed_at: DateTime<Utc>,
}

impl FailedJob {
    /// Create a new failure record.
    #[must_use]
    pub fn new(job: Job, error: impl Into<String>) -> Self {
        Self {
            job,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// FIFO of failed jobs waiting for their one retry.
///
/// Holds at most `cap` jobs; a push beyond that is refused and the job's
/// failure stays permanent.
#[derive(Debug)]
pub struct RetryQueue {
    cap: usize,
    jobs: VecDeque<Job>,
}

impl RetryQueue {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            jobs: VecDeque::with_capacity(cap),
        }
    }

    /// Queue a job. Returns `false` when the queue is full.
    pub fn push(&mut self, job: Job) -> bool {
        if self.jobs.len() >= self.cap {
            return false;
        }
        self.jobs.push_back(job);
        true
    }

    /// Take every queued job, oldest first.
    pub fn drain(&mut self) -> Vec<Job> {
        self.jobs.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    #[must_use]
    pub const fn cap(&self) -> usize {
        self.cap
    }
}
