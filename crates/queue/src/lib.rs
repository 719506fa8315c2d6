//! Batch execution for wp-batch.
//!
//! - **Batches**: fixed-size, order-preserving partitions of the job list
//! - **Scheduler**: bounded parallel batches with bounded workers per batch
//! - **Stats**: run counters under one lock
//! - **Retry**: bounded queue giving failed jobs one more attempt
//! - **Checkpoint**: progress snapshot written after every batch

pub mod batch;
pub mod checkpoint;
pub mod retry;
pub mod scheduler;
pub mod stats;

pub use batch::{Batch, batch_count, partition};
pub use checkpoint::{Checkpoint, CheckpointWriter, DEFAULT_CHECKPOINT_FILE, load_checkpoint};
pub use retry::{DEFAULT_RETRY_CAP, FailedJob, RetryQueue};
pub use scheduler::{
    BatchScheduler, CancellationFlag, ProgressCallback, RunReport, SchedulerConfig, eta_seconds,
};
pub use stats::{Recorded, RunStats, StatsSnapshot};
