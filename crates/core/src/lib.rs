//! Publishing logic for wp-batch.
//!
//! - [`FallbackPublisher`] runs a job through the REST stage and, when that
//!   fails for a reason another transport can fix, the browser stage.
//! - [`DriverHandle`] owns the one browser session of a run.
//! - [`CredentialBridge`] copies that session's cookies and nonce into the
//!   REST client.

pub mod bridge;
pub mod heavy;
pub mod job;
pub mod publisher;
pub mod webdriver;

pub use bridge::CredentialBridge;
pub use heavy::{DriverError, DriverFactory, DriverGuard, DriverHandle, DriverState, HeavyTransport};
pub use job::{Job, JobStatus, PublishOutcome};
pub use publisher::{
    FAST_STAGE_ATTEMPTS, FallbackPublisher, HeavyStage, PublishStage, RestStage, StageError,
};
pub use webdriver::{WebDriverFactory, WebDriverOptions, WebDriverSession, extract_nonce};

/// Generate a job ID.
#[must_use]
pub fn generate_job_id() -> String {
    wp_batch_common::IdGenerator::new().generate()
}
