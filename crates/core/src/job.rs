//! Publish jobs and their outcomes.

use serde::{Deserialize, Serialize};
use wp_batch_transport::{ErrorKind, PostDraft};

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One post to publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: PostDraft,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    /// Create a pending job.
    #[must_use]
    pub fn new(id: impl Into<String>, payload: PostDraft) -> Self {
        Self {
            id: id.into(),
            payload,
            attempts: 0,
            last_error: None,
            status: JobStatus::Pending,
        }
    }

    /// Record the result of one attempt.
    pub fn apply(&mut self, outcome: &PublishOutcome) {
        self.attempts += 1;
        match outcome {
            PublishOutcome::Published { .. } => {
                self.status = JobStatus::Succeeded;
                self.last_error = None;
            }
            PublishOutcome::Failed { error, .. } => {
                self.status = JobStatus::Failed;
                self.last_error = Some(error.clone());
            }
        }
    }
}

/// Result of publishing one job through the stage chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The post exists; `locator` is its public URL.
    Published { locator: String, stage: &'static str },
    /// Every eligible stage failed.
    Failed {
        error: String,
        kind: Option<ErrorKind>,
    },
}

impl PublishOutcome {
    /// Failure without a transport classification.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            kind: None,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Published { .. })
    }

    /// Whether one more attempt later could succeed.
    ///
    /// Rejected payloads and an unavailable browser are final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Published { .. } => false,
            Self::Failed { kind, .. } => kind.is_none_or(ErrorKind::allows_fallback),
        }
    }

    /// Locator on success, error description on failure.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::Published { locator, .. } => locator,
            Self::Failed { error, .. } => error,
        }
    }
}
