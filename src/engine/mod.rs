pub(crate) mod batch;
pub(crate) mod governor;
pub(crate) mod job;
pub(crate) mod ledger;
pub(crate) mod retry;
pub(crate) mod runner;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use time::PrimitiveDateTime;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::time::{format_primitive, primitive_now_utc};
use crate::engine::batch::{ProgressAggregator, ProgressSnapshot};
use crate::engine::job::derive_job_status;
use crate::engine::ledger::SubmissionLedger;
use crate::engine::retry::RetryPolicy;
use crate::engine::runner::{run_submission, RunnerContext};
use crate::extract::TextExtractor;
use crate::model::records::{Batch, Job, JobConfig, Submission};
use crate::model::types::{JobStatus, SubmissionStatus};
use crate::providers::registry::ProviderRegistry;
use crate::store::OutcomeStore;

/// A document handed in for grading, before text extraction.
pub(crate) struct DocumentInput {
    pub(crate) bytes: Vec<u8>,
    pub(crate) format: String,
}

#[derive(Debug, Clone)]
pub(crate) struct JobSnapshot {
    pub(crate) job_id: String,
    pub(crate) name: String,
    pub(crate) status: JobStatus,
    pub(crate) submission_statuses: Vec<SubmissionStatus>,
}

#[derive(Debug, Clone)]
pub(crate) struct BatchSnapshot {
    pub(crate) batch_id: String,
    pub(crate) name: String,
    pub(crate) progress: ProgressSnapshot,
}

pub(crate) struct EngineOptions {
    pub(crate) worker_pool_size: usize,
    pub(crate) retry: RetryPolicy,
    pub(crate) default_max_retries: u32,
}

impl EngineOptions {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            worker_pool_size: settings.engine().worker_pool_size,
            retry: RetryPolicy::from_settings(settings.retry()),
            default_max_retries: settings.engine().default_max_retries,
        }
    }
}

struct JobEntry {
    job: Job,
    cancelled: Arc<AtomicBool>,
}

struct BatchEntry {
    batch: Batch,
    progress: Arc<ProgressAggregator>,
}

struct EngineInner {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn OutcomeStore>,
    extractor: Arc<dyn TextExtractor>,
    ledger: Arc<SubmissionLedger>,
    retry: RetryPolicy,
    pool: Arc<Semaphore>,
    default_max_retries: u32,
    jobs: Mutex<HashMap<String, JobEntry>>,
    batches: Mutex<HashMap<String, BatchEntry>>,
}

/// The orchestration facade: owns batches, jobs and the submission ledger,
/// and drives grading through the worker pool and per-backend governors.
#[derive(Clone)]
pub(crate) struct GradingEngine {
    inner: Arc<EngineInner>,
}

impl GradingEngine {
    pub(crate) fn new(
        registry: ProviderRegistry,
        store: Arc<dyn OutcomeStore>,
        extractor: Arc<dyn TextExtractor>,
        options: EngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry: Arc::new(registry),
                store,
                extractor,
                ledger: Arc::new(SubmissionLedger::new()),
                retry: options.retry,
                pool: Arc::new(Semaphore::new(options.worker_pool_size)),
                default_max_retries: options.default_max_retries,
                jobs: Mutex::new(HashMap::new()),
                batches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn from_settings(
        settings: &Settings,
        store: Arc<dyn OutcomeStore>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Result<Self> {
        let registry = ProviderRegistry::from_settings(settings)
            .context("Failed to build provider registry")?;
        Ok(Self::new(registry, store, extractor, EngineOptions::from_settings(settings)))
    }

    fn runner_context(&self) -> RunnerContext {
        RunnerContext {
            ledger: self.inner.ledger.clone(),
            store: self.inner.store.clone(),
            registry: self.inner.registry.clone(),
            retry: self.inner.retry,
            pool: self.inner.pool.clone(),
        }
    }

    pub(crate) async fn create_batch(
        &self,
        name: &str,
        deadline: Option<PrimitiveDateTime>,
    ) -> Result<String> {
        let batch = Batch {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            deadline,
            job_ids: Vec::new(),
            created_at: primitive_now_utc(),
        };
        self.inner.store.upsert_batch(&batch).await.context("Failed to persist batch")?;

        let batch_id = batch.id.clone();
        let deadline_label = batch.deadline.map(format_primitive);
        let mut batches = self.inner.batches.lock().await;
        batches.insert(
            batch_id.clone(),
            BatchEntry { batch, progress: Arc::new(ProgressAggregator::new()) },
        );
        tracing::info!(batch_id = %batch_id, name, deadline = ?deadline_label, "Created batch");
        Ok(batch_id)
    }

    pub(crate) async fn create_job(
        &self,
        batch_id: &str,
        name: &str,
        mut config: JobConfig,
    ) -> Result<String> {
        if config.backends.is_empty() {
            bail!("A grading job needs at least one backend");
        }
        for backend in &config.backends {
            if !self.inner.registry.contains(backend) {
                bail!("Backend {backend} is not configured");
            }
        }
        if config.max_retries == 0 {
            config.max_retries = self.inner.default_max_retries;
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            name: name.to_string(),
            config,
            submission_ids: Vec::new(),
            created_at: primitive_now_utc(),
        };

        {
            let mut batches = self.inner.batches.lock().await;
            let entry = batches
                .get_mut(batch_id)
                .with_context(|| format!("Unknown batch {batch_id}"))?;
            entry.batch.job_ids.push(job.id.clone());
            self.inner.store.upsert_batch(&entry.batch).await.context("Failed to persist batch")?;
        }

        self.inner.store.upsert_job(&job).await.context("Failed to persist job")?;

        let job_id = job.id.clone();
        let mut jobs = self.inner.jobs.lock().await;
        jobs.insert(job_id.clone(), JobEntry { job, cancelled: Arc::new(AtomicBool::new(false)) });
        tracing::info!(batch_id, job_id = %job_id, name, "Created grading job");
        Ok(job_id)
    }

    /// Registers submissions with a job. A document that cannot be extracted
    /// still becomes a submission; its empty text takes the invalid-input
    /// path at grading time so the failure is recorded like any other.
    pub(crate) async fn add_submissions(
        &self,
        job_id: &str,
        documents: Vec<DocumentInput>,
    ) -> Result<Vec<String>> {
        let count = documents.len();
        let mut submissions = Vec::with_capacity(count);
        for document in documents {
            let text = match self.inner.extractor.extract(&document.bytes, &document.format).await {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(job_id, error = %err, "Document extraction failed");
                    String::new()
                }
            };
            submissions.push(text);
        }

        let mut jobs = self.inner.jobs.lock().await;
        let entry = jobs.get_mut(job_id).with_context(|| format!("Unknown job {job_id}"))?;

        let now = primitive_now_utc();
        let mut ids = Vec::with_capacity(count);
        for text in submissions {
            let mut submission =
                Submission::new(Uuid::new_v4().to_string(), job_id.to_string(), text, now);
            submission.max_retries = entry.job.config.max_retries;

            self.inner
                .store
                .upsert_submission(&submission)
                .await
                .context("Failed to persist submission")?;
            ids.push(submission.id.clone());
            entry.job.submission_ids.push(submission.id.clone());
            self.inner.ledger.insert(submission).await;
        }
        self.inner.store.upsert_job(&entry.job).await.context("Failed to persist job")?;

        let batches = self.inner.batches.lock().await;
        if let Some(batch_entry) = batches.get(&entry.job.batch_id) {
            batch_entry.progress.add_submissions(count);
        }

        tracing::info!(job_id, count, "Added submissions");
        Ok(ids)
    }

    /// Runs a job to quiescence: every submission reaches a terminal state,
    /// or the job is cancelled and the remainder returns to Pending.
    pub(crate) async fn run_job(&self, job_id: &str) -> Result<JobStatus> {
        let (job, cancelled) = {
            let jobs = self.inner.jobs.lock().await;
            let entry = jobs.get(job_id).with_context(|| format!("Unknown job {job_id}"))?;
            (Arc::new(entry.job.clone()), entry.cancelled.clone())
        };
        let progress = self.progress_for(&job.batch_id).await?;

        job::run_job(self.runner_context(), job.clone(), cancelled.clone(), progress).await;

        let statuses = self.inner.ledger.statuses(&job.submission_ids).await;
        Ok(derive_job_status(&statuses, cancelled.load(Ordering::Relaxed)))
    }

    /// Manual retry of a terminally failed submission. Only the failed
    /// backends run again; the attempt budget restarts for them while the
    /// audit trail keeps its monotonic attempt numbers.
    pub(crate) async fn retry_submission(&self, submission_id: &str) -> Result<SubmissionStatus> {
        let snapshot = self
            .inner
            .ledger
            .snapshot(submission_id)
            .await
            .with_context(|| format!("Unknown submission {submission_id}"))?;
        if !matches!(
            snapshot.status,
            SubmissionStatus::Failed | SubmissionStatus::PartiallyFailed
        ) {
            bail!("Submission {submission_id} is not in a retryable state");
        }

        let (job, cancelled) = {
            let jobs = self.inner.jobs.lock().await;
            let entry = jobs
                .get(&snapshot.job_id)
                .with_context(|| format!("Unknown job {}", snapshot.job_id))?;
            (Arc::new(entry.job.clone()), entry.cancelled.clone())
        };
        // A cancelled job never schedules attempts again, so reopening the
        // submission would strand it at Pending.
        if cancelled.load(Ordering::Relaxed) {
            bail!("Job {} is cancelled; submission {submission_id} cannot be retried", job.id);
        }
        let progress = self.progress_for(&job.batch_id).await?;

        let reopened = self
            .inner
            .ledger
            .reopen_failed(submission_id, &job.config.backends)
            .await
            .with_context(|| format!("Unknown submission {submission_id}"))?;
        progress.reopen(submission_id);
        self.inner
            .store
            .upsert_submission(&reopened)
            .await
            .context("Failed to persist reopened submission")?;
        tracing::info!(
            job_id = %job.id,
            submission_id,
            "Retrying failed submission"
        );

        run_submission(
            self.runner_context(),
            job,
            submission_id.to_string(),
            cancelled,
            progress,
        )
        .await?;

        let settled = self
            .inner
            .ledger
            .snapshot(submission_id)
            .await
            .with_context(|| format!("Unknown submission {submission_id}"))?;
        Ok(settled.status)
    }

    /// Stops scheduling new attempts for a job. In-flight backend calls run
    /// to their recorded outcome; unfinished submissions return to Pending.
    pub(crate) async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let jobs = self.inner.jobs.lock().await;
        let entry = jobs.get(job_id).with_context(|| format!("Unknown job {job_id}"))?;
        entry.cancelled.store(true, Ordering::Relaxed);
        tracing::info!(job_id, "Cancelled grading job");
        Ok(())
    }

    pub(crate) async fn cancel_batch(&self, batch_id: &str) -> Result<()> {
        let job_ids = {
            let batches = self.inner.batches.lock().await;
            let entry =
                batches.get(batch_id).with_context(|| format!("Unknown batch {batch_id}"))?;
            entry.batch.job_ids.clone()
        };
        for job_id in &job_ids {
            self.cancel_job(job_id).await?;
        }
        tracing::info!(batch_id, jobs = job_ids.len(), "Cancelled batch");
        Ok(())
    }

    pub(crate) async fn job_snapshot(&self, job_id: &str) -> Result<JobSnapshot> {
        let (job, cancelled) = {
            let jobs = self.inner.jobs.lock().await;
            let entry = jobs.get(job_id).with_context(|| format!("Unknown job {job_id}"))?;
            (entry.job.clone(), entry.cancelled.load(Ordering::Relaxed))
        };
        let statuses = self.inner.ledger.statuses(&job.submission_ids).await;
        Ok(JobSnapshot {
            job_id: job.id,
            name: job.name,
            status: derive_job_status(&statuses, cancelled),
            submission_statuses: statuses,
        })
    }

    pub(crate) async fn batch_snapshot(&self, batch_id: &str) -> Result<BatchSnapshot> {
        let batches = self.inner.batches.lock().await;
        let entry = batches.get(batch_id).with_context(|| format!("Unknown batch {batch_id}"))?;
        Ok(BatchSnapshot {
            batch_id: entry.batch.id.clone(),
            name: entry.batch.name.clone(),
            progress: entry.progress.snapshot(),
        })
    }

    pub(crate) async fn submission_snapshot(&self, submission_id: &str) -> Result<Submission> {
        self.inner
            .ledger
            .snapshot(submission_id)
            .await
            .with_context(|| format!("Unknown submission {submission_id}"))
    }

    /// Restart recovery: submissions whose last durable status is Dispatched
    /// may have lost their outcome, so they return to Pending and run again.
    /// Replayed outcome appends de-duplicate in the store (at-least-once).
    /// Batch counters are rebuilt by a full recount afterwards, since the
    /// incremental terminal notifications for the requeued work are stale.
    pub(crate) async fn recover_dispatched(&self) -> Result<usize> {
        let stranded = self
            .inner
            .store
            .list_dispatched()
            .await
            .context("Failed to list dispatched submissions")?;
        for submission_id in &stranded {
            if let Some(reset) =
                self.inner.ledger.set_status(submission_id, SubmissionStatus::Pending).await
            {
                self.inner
                    .store
                    .upsert_submission(&reset)
                    .await
                    .context("Failed to persist recovered submission")?;
            }
        }

        let jobs = self.inner.jobs.lock().await;
        let batches = self.inner.batches.lock().await;
        for entry in batches.values() {
            let mut submission_ids = Vec::new();
            for job_id in &entry.batch.job_ids {
                if let Some(job_entry) = jobs.get(job_id) {
                    submission_ids.extend(job_entry.job.submission_ids.iter().cloned());
                }
            }
            let snapshots = self.inner.ledger.snapshots(&submission_ids).await;
            entry.progress.reconcile(&snapshots);
        }

        if !stranded.is_empty() {
            tracing::info!(count = stranded.len(), "Recovered dispatched submissions");
        }
        Ok(stranded.len())
    }

    /// Graceful shutdown: flag every job cancelled so no new attempts start.
    pub(crate) async fn shutdown(&self) {
        let jobs = self.inner.jobs.lock().await;
        for entry in jobs.values() {
            entry.cancelled.store(true, Ordering::Relaxed);
        }
        tracing::info!(jobs = jobs.len(), "Grading engine shut down");
    }

    async fn progress_for(&self, batch_id: &str) -> Result<Arc<ProgressAggregator>> {
        let batches = self.inner.batches.lock().await;
        batches
            .get(batch_id)
            .map(|entry| entry.progress.clone())
            .with_context(|| format!("Unknown batch {batch_id}"))
    }
}
