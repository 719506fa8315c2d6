//! Job input and failure report files.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use wp_batch_common::{AppError, AppResult};
use wp_batch_core::{Job, generate_job_id};
use wp_batch_queue::FailedJob;
use wp_batch_transport::PostDraft;

/// Read a JSON array of posts and give each one a job ID.
///
/// Posts without a title are skipped.
pub(crate) async fn load_jobs(path: &Path) -> AppResult<Vec<Job>> {
    let body = tokio::fs::read(path).await?;
    let drafts: Vec<PostDraft> = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidInput(format!("{}: {e}", path.display())))?;

    let read = drafts.len();
    let jobs: Vec<Job> = drafts
        .into_iter()
        .filter(|draft| !draft.title.trim().is_empty())
        .map(|draft| Job::new(generate_job_id(), draft))
        .collect();

    if jobs.len() < read {
        warn!(skipped = read - jobs.len(), "Skipped posts without a title");
    }
    info!(path = %path.display(), jobs = jobs.len(), "Loaded jobs");
    Ok(jobs)
}

#[derive(Serialize)]
struct FailureRecord<'a> {
    id: &'a str,
    title: &'a str,
    error: &'a str,
    attempts: u32,
    failed_at: DateTime<Utc>,
}

/// Write the failed posts so they can be fixed and resubmitted.
pub(crate) async fn write_failure_report(path: &Path, failed: &[FailedJob]) -> AppResult<()> {
    let records: Vec<FailureRecord<'_>> = failed
        .iter()
        .map(|f| FailureRecord {
            id: &f.job.id,
            title: &f.job.payload.title,
            error: &f.error,
            attempts: f.job.attempts,
            failed_at: f.failed_at,
        })
        .collect();

    tokio::fs::write(path, serde_json::to_vec_pretty(&records)?).await?;
    warn!(path = %path.display(), failed = records.len(), "Failure report written");
    Ok(())
}
