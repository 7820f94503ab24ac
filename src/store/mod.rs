use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::records::{Batch, GradeOutcome, Job, Submission};
use crate::model::types::SubmissionStatus;

/// Persistence collaborator. The engine emits every state transition through
/// here as an idempotent upsert, and a transition is durably recorded before
/// the corresponding in-memory status is treated as final. On an ambiguous
/// crash a submission last recorded as Dispatched is re-attempted
/// (at-least-once); replayed outcome appends are de-duplicated.
#[async_trait]
pub(crate) trait OutcomeStore: Send + Sync {
    async fn upsert_submission(&self, submission: &Submission) -> Result<()>;

    /// Idempotent on (submission, backend, attempt); returns false when the
    /// outcome was already recorded, so redelivery cannot double-count.
    async fn append_outcome(&self, submission_id: &str, outcome: &GradeOutcome) -> Result<bool>;

    async fn upsert_job(&self, job: &Job) -> Result<()>;

    async fn upsert_batch(&self, batch: &Batch) -> Result<()>;

    /// Submissions whose last durable status is Dispatched; used by restart
    /// recovery to re-queue work whose outcome may have been lost.
    async fn list_dispatched(&self) -> Result<Vec<String>>;
}

#[derive(Default)]
struct MemoryStoreInner {
    submissions: HashMap<String, Submission>,
    outcome_keys: HashSet<(String, String, u32)>,
    jobs: HashMap<String, Job>,
    batches: HashMap<String, Batch>,
}

/// In-process store for the single-orchestrator deployment and for tests.
#[derive(Default)]
pub(crate) struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutcomeStore for MemoryStore {
    async fn upsert_submission(&self, submission: &Submission) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.submissions.insert(submission.id.clone(), submission.clone());
        Ok(())
    }

    async fn append_outcome(&self, submission_id: &str, outcome: &GradeOutcome) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = (submission_id.to_string(), outcome.backend.clone(), outcome.attempt);
        if !inner.outcome_keys.insert(key) {
            return Ok(false);
        }

        if let Some(submission) = inner.submissions.get_mut(submission_id) {
            submission.outcomes.push(outcome.clone());
        }
        Ok(true)
    }

    async fn upsert_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn upsert_batch(&self, batch: &Batch) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn list_dispatched(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .submissions
            .values()
            .filter(|submission| submission.status == SubmissionStatus::Dispatched)
            .map(|submission| submission.id.clone())
            .collect())
    }
}
