use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::core::time::primitive_now_utc;
use crate::engine::batch::ProgressAggregator;
use crate::engine::ledger::SubmissionLedger;
use crate::engine::retry::{RetryDecision, RetryPolicy};
use crate::model::records::{GradeOutcome, Job, OutcomeKind};
use crate::model::types::SubmissionStatus;
use crate::providers::registry::ProviderRegistry;
use crate::providers::{GradeCall, GradeReply};
use crate::store::OutcomeStore;

/// Shared handles a submission runner needs; cheap to clone per branch.
#[derive(Clone)]
pub(crate) struct RunnerContext {
    pub(crate) ledger: Arc<SubmissionLedger>,
    pub(crate) store: Arc<dyn OutcomeStore>,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) retry: RetryPolicy,
    /// Bounds concurrently executing attempts across all jobs; released
    /// before any backoff sleep so waiting work cannot starve the pool.
    pub(crate) pool: Arc<Semaphore>,
}

/// Drives one submission from Pending through Dispatched to a terminal
/// state: one concurrent branch per requested backend, a barrier over all
/// branches before the submission-level transition.
pub(crate) async fn run_submission(
    ctx: RunnerContext,
    job: Arc<Job>,
    submission_id: String,
    cancelled: Arc<AtomicBool>,
    progress: Arc<ProgressAggregator>,
) -> Result<()> {
    let snapshot = ctx
        .ledger
        .snapshot(&submission_id)
        .await
        .with_context(|| format!("Unknown submission {submission_id}"))?;
    if snapshot.status.is_terminal() || cancelled.load(Ordering::Relaxed) {
        return Ok(());
    }

    let dispatched = ctx
        .ledger
        .mark_dispatched(&submission_id)
        .await
        .with_context(|| format!("Unknown submission {submission_id}"))?;
    ctx.store
        .upsert_submission(&dispatched)
        .await
        .context("Failed to record dispatch transition")?;

    let queue_latency =
        (dispatched.updated_at.assume_utc() - dispatched.created_at.assume_utc()).as_seconds_f64();
    metrics::histogram!("grading_queue_latency_seconds").record(queue_latency.max(0.0));

    let mut branches = JoinSet::new();
    for backend in &job.config.backends {
        // A manual retry re-runs only the branches that have not succeeded.
        if dispatched.backend_succeeded(backend) {
            continue;
        }
        branches.spawn(run_backend_branch(
            ctx.clone(),
            job.clone(),
            submission_id.clone(),
            backend.clone(),
            cancelled.clone(),
        ));
    }

    while let Some(joined) = branches.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(
                    job_id = %job.id,
                    submission_id = %submission_id,
                    error = %err,
                    "Backend branch failed"
                );
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job.id,
                    submission_id = %submission_id,
                    error = %err,
                    "Backend branch join failed"
                );
            }
        }
    }

    let settled = ctx
        .ledger
        .settle(&submission_id, &job.config.backends)
        .await
        .with_context(|| format!("Unknown submission {submission_id}"))?;

    if settled.status.is_terminal() {
        ctx.store
            .upsert_submission(&settled)
            .await
            .context("Failed to record terminal transition")?;
        progress.record_terminal(&submission_id, settled.status);
        metrics::counter!("grading_submissions_total", "status" => status_label(settled.status))
            .increment(1);
        tracing::info!(
            job_id = %job.id,
            submission_id = %submission_id,
            status = ?settled.status,
            attempts = settled.outcomes.len(),
            "Submission settled"
        );
    } else {
        // Cancelled mid-flight: return the submission to the queue so a
        // later run (or restart recovery) can pick it up.
        if let Some(reset) =
            ctx.ledger.set_status(&submission_id, SubmissionStatus::Pending).await
        {
            ctx.store
                .upsert_submission(&reset)
                .await
                .context("Failed to record requeue transition")?;
        }
        tracing::info!(
            job_id = %job.id,
            submission_id = %submission_id,
            "Submission requeued after cancellation"
        );
    }

    Ok(())
}

async fn run_backend_branch(
    ctx: RunnerContext,
    job: Arc<Job>,
    submission_id: String,
    backend: String,
    cancelled: Arc<AtomicBool>,
) -> Result<()> {
    let handle = ctx
        .registry
        .get(&backend)
        .cloned()
        .with_context(|| format!("Backend {backend} is not configured"))?;

    loop {
        // Cancellation is consulted before each new attempt is scheduled;
        // an in-flight call below always runs to its recorded outcome.
        if cancelled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let (reply, attempt, epoch_attempt, max_retries) = {
            let _worker = ctx
                .pool
                .clone()
                .acquire_owned()
                .await
                .context("Worker pool semaphore closed")?;
            let _slot = handle.governor.acquire().await;

            let snapshot = ctx
                .ledger
                .snapshot(&submission_id)
                .await
                .with_context(|| format!("Unknown submission {submission_id}"))?;
            let attempt = snapshot.total_attempts_for(&backend) + 1;
            let epoch_attempt = snapshot.epoch_attempts_for(&backend) + 1;

            let call = GradeCall {
                text: snapshot.text.clone(),
                prompt: job.config.prompt.clone(),
                params: job.config.params.clone(),
                submission_id: submission_id.clone(),
                attempt,
            };

            let timer = Instant::now();
            let reply = handle.gateway.grade(call).await;
            metrics::histogram!("grading_backend_seconds", "backend" => backend.clone())
                .record(timer.elapsed().as_secs_f64());

            (reply, attempt, epoch_attempt, snapshot.max_retries)
            // Worker-pool permit and governor slot released here, before any
            // backoff sleep.
        };

        match reply {
            GradeReply::Success { grade, usage, model } => {
                let outcome = GradeOutcome {
                    backend: backend.clone(),
                    model,
                    attempt,
                    kind: OutcomeKind::Success { grade, usage },
                    recorded_at: primitive_now_utc(),
                };
                record(&ctx, &job, &submission_id, outcome).await?;
                metrics::counter!(
                    "grading_attempts_total",
                    "backend" => backend.clone(),
                    "status" => "success"
                )
                .increment(1);
                return Ok(());
            }
            GradeReply::Failure { class, message, retry_after } => {
                let decision = ctx.retry.decide(class, epoch_attempt, max_retries, retry_after);
                let permanent = decision == RetryDecision::FailPermanently;

                let outcome = GradeOutcome {
                    backend: backend.clone(),
                    model: handle.gateway.default_model().to_string(),
                    attempt,
                    kind: OutcomeKind::Failure { class, message: message.clone(), permanent },
                    recorded_at: primitive_now_utc(),
                };
                record(&ctx, &job, &submission_id, outcome).await?;
                metrics::counter!(
                    "grading_attempts_total",
                    "backend" => backend.clone(),
                    "status" => class.as_str()
                )
                .increment(1);

                match decision {
                    RetryDecision::FailPermanently => {
                        tracing::warn!(
                            job_id = %job.id,
                            submission_id = %submission_id,
                            backend = %backend,
                            attempt,
                            class = class.as_str(),
                            error = %message,
                            "Backend branch failed permanently"
                        );
                        return Ok(());
                    }
                    RetryDecision::RetryAfter(delay) => {
                        tracing::info!(
                            job_id = %job.id,
                            submission_id = %submission_id,
                            backend = %backend,
                            attempt,
                            class = class.as_str(),
                            delay_ms = delay.as_millis() as u64,
                            "Retrying backend call after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// Durable first, in-memory second: the outcome reaches the store before the
/// ledger treats the transition as final.
async fn record(
    ctx: &RunnerContext,
    job: &Job,
    submission_id: &str,
    outcome: GradeOutcome,
) -> Result<()> {
    ctx.store
        .append_outcome(submission_id, &outcome)
        .await
        .context("Failed to record grade outcome")?;
    ctx.ledger.record_outcome(submission_id, outcome, &job.config.backends).await;
    Ok(())
}

fn status_label(status: SubmissionStatus) -> &'static str {
    match status {
        SubmissionStatus::Pending => "pending",
        SubmissionStatus::Dispatched => "dispatched",
        SubmissionStatus::Completed => "completed",
        SubmissionStatus::PartiallyFailed => "partially_failed",
        SubmissionStatus::Failed => "failed",
    }
}
