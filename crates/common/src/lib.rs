//! Common utilities and shared types for wp-batch.
//!
//! This crate provides foundational components used across all wp-batch crates:
//!
//! - **Configuration**: Layered settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based job identifiers via [`IdGenerator`]
//! - **Metrics**: Request and job counters via [`Metrics`]
//!
//! # Example
//!
//! ```no_run
//! use wp_batch_common::{AppResult, Config, IdGenerator};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!     let id = IdGenerator::new().generate();
//!     println!("Publishing to {} as job {id}", config.site.url);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod metrics;

pub use config::{BatchConfig, Config, DriverConfig, SiteConfig, TransportConfig, UploadMode};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
pub use metrics::{Metrics, MetricsSnapshot, get_metrics};
