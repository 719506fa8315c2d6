//! Ordered publish stages with fallback.
//!
//! A job goes through the REST stage first and falls back to the browser
//! only when the failure says another transport might still work.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};
use wp_batch_common::{Metrics, get_metrics};
use wp_batch_transport::{ErrorKind, RateLimitedTransport, TransportError};

use crate::bridge::CredentialBridge;
use crate::heavy::{DriverError, DriverHandle};
use crate::job::{Job, PublishOutcome};

/// Attempts the REST stage makes before giving up.
pub const FAST_STAGE_ATTEMPTS: u32 = 2;

/// Error from one publish stage.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl StageError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) => e.kind(),
            Self::Driver(e) => e.kind(),
        }
    }
}

/// One way of getting a post onto the site.
#[async_trait]
pub trait PublishStage: Send + Sync {
    /// Name used in logs and outcomes.
    fn name(&self) -> &'static str;

    /// Publish the job's post and return its URL.
    async fn publish(&self, job: &Job) -> Result<String, StageError>;
}

/// Publishes through the REST API.
pub struct RestStage {
    transport: RateLimitedTransport,
    bridge: Option<Arc<CredentialBridge>>,
}

impl RestStage {
    #[must_use]
    pub const fn new(transport: RateLimitedTransport) -> Self {
        Self {
            transport,
            bridge: None,
        }
    }

    /// Resync credentials through `bridge` when the site rejects them.
    #[must_use]
    pub fn with_bridge(mut self, bridge: Arc<CredentialBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    async fn resync(&self, bridge: &CredentialBridge) -> bool {
        bridge.invalidate_nonce().await;
        match bridge.sync().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Credential resync failed");
                false
            }
        }
    }
}

#[async_trait]
impl PublishStage for RestStage {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn publish(&self, job: &Job) -> Result<String, StageError> {
        let mut attempt = 0;
        let mut resynced = false;

        loop {
            attempt += 1;
            let err = match self.transport.publish_post(&job.payload).await {
                Ok(post) => {
                    debug!(job_id = %job.id, post_id = post.id, "Published over REST");
                    return Ok(post.link);
                }
                Err(e) => e,
            };

            match (err.kind(), &self.bridge) {
                (kind, _) if !kind.allows_fallback() => return Err(err.into()),
                // A resync always earns one more attempt.
                (ErrorKind::AuthExpired, Some(bridge)) if !resynced => {
                    resynced = true;
                    info!(job_id = %job.id, "Credentials rejected, resyncing");
                    if !self.resync(bridge).await {
                        return Err(err.into());
                    }
                }
                // Same credentials would be rejected again.
                (ErrorKind::AuthExpired, _) => return Err(err.into()),
                _ if attempt < FAST_STAGE_ATTEMPTS => {
                    debug!(job_id = %job.id, attempt, error = %err, "REST publish failed, retrying");
                }
                _ => return Err(err.into()),
            }
        }
    }
}

/// Publishes by driving the browser.
pub struct HeavyStage {
    driver: Arc<DriverHandle>,
}

impl HeavyStage {
    #[must_use]
    pub const fn new(driver: Arc<DriverHandle>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl PublishStage for HeavyStage {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn publish(&self, job: &Job) -> Result<String, StageError> {
        let mut driver = self.driver.acquire().await?;
        let locator = driver.publish(&job.payload).await?;
        debug!(job_id = %job.id, "Published through browser");
        Ok(locator)
    }
}

/// Runs a job through its stages in order.
pub struct FallbackPublisher {
    stages: Vec<Arc<dyn PublishStage>>,
    metrics: Arc<Metrics>,
}

impl FallbackPublisher {
    #[must_use]
    pub fn new(stages: Vec<Arc<dyn PublishStage>>) -> Self {
        Self {
            stages,
            metrics: get_metrics().clone(),
        }
    }

    /// Record into `metrics` instead of the global instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stage names in the order they are tried.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Publish one job. Never returns an error: failures become
    /// [`PublishOutcome::Failed`].
    pub async fn publish(&self, job: &Job) -> PublishOutcome {
        let mut last_error: Option<StageError> = None;

        for (index, stage) in self.stages.iter().enumerate() {
            let fallback = index > 0;
            if let Some(prev) = &last_error {
                info!(
                    job_id = %job.id,
                    stage = stage.name(),
                    reason = %prev.kind(),
                    "Falling back"
                );
            }

            match stage.publish(job).await {
                Ok(locator) => {
                    if fallback {
                        self.metrics.record_fallback(true);
                    }
                    return PublishOutcome::Published {
                        locator,
                        stage: stage.name(),
                    };
                }
                Err(e) => {
                    if fallback {
                        self.metrics.record_fallback(false);
                    }
                    let kind = e.kind();
                    warn!(
                        job_id = %job.id,
                        title = %job.payload.title,
                        stage = stage.name(),
                        kind = %kind,
                        error = %e,
                        "Publish stage failed"
                    );
                    let terminal = !kind.allows_fallback();
                    last_error = Some(e);
                    if terminal {
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(e) => PublishOutcome::Failed {
                error: e.to_string(),
                kind: Some(e.kind()),
            },
            None => PublishOutcome::failed("no publish stage configured"),
        }
    }
}
