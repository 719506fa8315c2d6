//! Progress snapshots written to disk after every batch.
//!
//! The file is informational: a later run may display it but never resumes
//! from it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wp_batch_common::AppResult;

use crate::stats::StatsSnapshot;

/// Default checkpoint file name.
pub const DEFAULT_CHECKPOINT_FILE: &str = "upload_checkpoint.json";

/// Contents of the checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Checkpoint {
    #[must_use]
    pub fn from_snapshot(snapshot: &StatsSnapshot) -> Self {
        Self {
            total: snapshot.total,
            completed: snapshot.completed,
            failed: snapshot.failed,
            timestamp: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
        }
    }
}

/// Serializes checkpoint writes from concurrently finishing batches.
///
/// Holds the highest `completed` written so far; an older snapshot that
/// loses the race to the lock is dropped, so the file never goes backwards.
pub struct CheckpointWriter {
    path: PathBuf,
    written: Mutex<Option<usize>>,
}

impl CheckpointWriter {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the checkpoint file, unless `snapshot` is older than what
    /// is already on disk.
    ///
    /// Writes to a sibling temp file first so a reader never sees a partial
    /// document.
    pub async fn save(&self, snapshot: &StatsSnapshot) -> AppResult<()> {
        let mut written = self.written.lock().await;
        if written.is_some_and(|completed| snapshot.completed < completed) {
            debug!(completed = snapshot.completed, "Stale checkpoint skipped");
            return Ok(());
        }

        let checkpoint = Checkpoint::from_snapshot(snapshot);
        let body = serde_json::to_vec_pretty(&checkpoint)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        *written = Some(checkpoint.completed);

        debug!(
            path = %self.path.display(),
            completed = checkpoint.completed,
            failed = checkpoint.failed,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Save, logging instead of failing. A lost checkpoint never stops a run.
    pub async fn save_or_warn(&self, snapshot: &StatsSnapshot) {
        if let Err(e) = self.save(snapshot).await {
            warn!(path = %self.path.display(), error = %e, "Failed to save checkpoint");
        }
    }
}

/// Read the last checkpoint, if any.
pub async fn load_checkpoint(path: &Path) -> AppResult<Option<Checkpoint>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
