use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::engine::batch::ProgressAggregator;
use crate::engine::runner::{run_submission, RunnerContext};
use crate::model::records::Job;
use crate::model::types::{JobStatus, SubmissionStatus};

/// Job status is derived from member submission statuses plus the cancel
/// flag; nothing stores it independently, so it can never drift. A job whose
/// submissions are all still Pending reports Pending, not Processing: a job
/// starts out Pending and only counts as in progress once at least one
/// submission has been dispatched or settled.
pub(crate) fn derive_job_status(statuses: &[SubmissionStatus], cancelled: bool) -> JobStatus {
    if cancelled {
        return JobStatus::Cancelled;
    }
    if statuses.is_empty() {
        return JobStatus::Pending;
    }
    if statuses.iter().all(|status| *status == SubmissionStatus::Pending) {
        return JobStatus::Pending;
    }
    if statuses
        .iter()
        .any(|status| matches!(status, SubmissionStatus::Pending | SubmissionStatus::Dispatched))
    {
        return JobStatus::Processing;
    }
    if statuses.iter().all(|status| *status == SubmissionStatus::Completed) {
        return JobStatus::Completed;
    }
    if statuses.iter().all(|status| *status == SubmissionStatus::Failed) {
        return JobStatus::Failed;
    }
    JobStatus::PartiallyFailed
}

/// Runs every submission of a job to a terminal state. Submissions execute
/// concurrently; per-backend governors and the shared worker pool bound the
/// actual parallelism, so the spawn fan-out here is cheap.
pub(crate) async fn run_job(
    ctx: RunnerContext,
    job: Arc<Job>,
    cancelled: Arc<AtomicBool>,
    progress: Arc<ProgressAggregator>,
) {
    tracing::info!(
        job_id = %job.id,
        submissions = job.submission_ids.len(),
        backends = job.config.backends.len(),
        "Starting grading job"
    );

    let mut tasks = JoinSet::new();
    for submission_id in &job.submission_ids {
        if cancelled.load(Ordering::Relaxed) {
            break;
        }
        tasks.spawn(run_submission(
            ctx.clone(),
            job.clone(),
            submission_id.clone(),
            cancelled.clone(),
            progress.clone(),
        ));
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(job_id = %job.id, error = %err, "Submission run failed");
            }
            Err(err) => {
                tracing::error!(job_id = %job.id, error = %err, "Submission task join failed");
            }
        }
    }

    let statuses = ctx.ledger.statuses(&job.submission_ids).await;
    let status = derive_job_status(&statuses, cancelled.load(Ordering::Relaxed));
    tracing::info!(job_id = %job.id, status = ?status, "Grading job finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::types::SubmissionStatus::{
        Completed, Dispatched, Failed, PartiallyFailed, Pending,
    };

    #[test]
    fn cancel_flag_wins() {
        assert_eq!(derive_job_status(&[Completed, Completed], true), JobStatus::Cancelled);
    }

    #[test]
    fn empty_job_is_pending() {
        assert_eq!(derive_job_status(&[], false), JobStatus::Pending);
    }

    #[test]
    fn untouched_job_is_pending() {
        assert_eq!(derive_job_status(&[Pending, Pending], false), JobStatus::Pending);
    }

    #[test]
    fn open_work_means_processing() {
        assert_eq!(derive_job_status(&[Completed, Dispatched], false), JobStatus::Processing);
        assert_eq!(derive_job_status(&[Completed, Pending], false), JobStatus::Processing);
    }

    #[test]
    fn uniform_terminal_statuses_map_directly() {
        assert_eq!(derive_job_status(&[Completed, Completed], false), JobStatus::Completed);
        assert_eq!(derive_job_status(&[Failed, Failed], false), JobStatus::Failed);
    }

    #[test]
    fn mixed_terminal_statuses_partially_fail() {
        assert_eq!(derive_job_status(&[Completed, Failed], false), JobStatus::PartiallyFailed);
        assert_eq!(derive_job_status(&[PartiallyFailed], false), JobStatus::PartiallyFailed);
    }
}
