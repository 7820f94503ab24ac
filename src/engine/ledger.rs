use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::core::time::primitive_now_utc;
use crate::model::records::{GradeOutcome, OutcomeKind, Submission};
use crate::model::types::SubmissionStatus;

/// In-memory authority for submission state. Only the runner mutates a
/// submission's status through here; jobs and batches derive their own state
/// from ledger snapshots and never cache it independently.
pub(crate) struct SubmissionLedger {
    submissions: Mutex<HashMap<String, Submission>>,
}

impl SubmissionLedger {
    pub(crate) fn new() -> Self {
        Self { submissions: Mutex::new(HashMap::new()) }
    }

    pub(crate) async fn insert(&self, submission: Submission) {
        let mut submissions = self.submissions.lock().await;
        submissions.insert(submission.id.clone(), submission);
    }

    pub(crate) async fn snapshot(&self, id: &str) -> Option<Submission> {
        let submissions = self.submissions.lock().await;
        submissions.get(id).cloned()
    }

    pub(crate) async fn snapshots(&self, ids: &[String]) -> Vec<Submission> {
        let submissions = self.submissions.lock().await;
        ids.iter().filter_map(|id| submissions.get(id).cloned()).collect()
    }

    pub(crate) async fn statuses(&self, ids: &[String]) -> Vec<SubmissionStatus> {
        let submissions = self.submissions.lock().await;
        ids.iter()
            .filter_map(|id| submissions.get(id).map(|submission| submission.status))
            .collect()
    }

    pub(crate) async fn mark_dispatched(&self, id: &str) -> Option<Submission> {
        let mut submissions = self.submissions.lock().await;
        let submission = submissions.get_mut(id)?;
        submission.status = SubmissionStatus::Dispatched;
        submission.updated_at = primitive_now_utc();
        Some(submission.clone())
    }

    /// Appends an outcome, bumps the backend's epoch attempt counter, and
    /// performs the terminal transition once every requested branch is
    /// terminal. Returns the post-update snapshot.
    pub(crate) async fn record_outcome(
        &self,
        id: &str,
        outcome: GradeOutcome,
        backends: &[String],
    ) -> Option<Submission> {
        let mut submissions = self.submissions.lock().await;
        let submission = submissions.get_mut(id)?;

        if let OutcomeKind::Failure { class, message, .. } = &outcome.kind {
            submission.last_error_class = Some(*class);
            submission.last_error_message = Some(message.clone());
        }

        *submission.epoch_attempts.entry(outcome.backend.clone()).or_insert(0) += 1;
        submission.outcomes.push(outcome);
        submission.updated_at = primitive_now_utc();

        if let Some(terminal) = submission.derive_terminal_status(backends) {
            submission.status = terminal;
        }

        Some(submission.clone())
    }

    /// Performs the terminal transition if every requested branch already has
    /// a terminal outcome. Covers recovered submissions whose outcomes were
    /// durably recorded but whose status transition was lost; a submission
    /// with open branches is returned unchanged.
    pub(crate) async fn settle(&self, id: &str, backends: &[String]) -> Option<Submission> {
        let mut submissions = self.submissions.lock().await;
        let submission = submissions.get_mut(id)?;
        if !submission.status.is_terminal() {
            if let Some(terminal) = submission.derive_terminal_status(backends) {
                submission.status = terminal;
                submission.updated_at = primitive_now_utc();
            }
        }
        Some(submission.clone())
    }

    pub(crate) async fn set_status(&self, id: &str, status: SubmissionStatus) -> Option<Submission> {
        let mut submissions = self.submissions.lock().await;
        let submission = submissions.get_mut(id)?;
        submission.status = status;
        submission.updated_at = primitive_now_utc();
        Some(submission.clone())
    }

    /// Manual retry: re-opens a terminal submission, resetting only the
    /// failed backends' epoch attempt counters. Successful branches and the
    /// audit trail are untouched.
    pub(crate) async fn reopen_failed(&self, id: &str, backends: &[String]) -> Option<Submission> {
        let mut submissions = self.submissions.lock().await;
        let submission = submissions.get_mut(id)?;

        for backend in backends {
            if !submission.backend_succeeded(backend) {
                submission.epoch_attempts.insert(backend.clone(), 0);
            }
        }
        submission.status = SubmissionStatus::Pending;
        submission.updated_at = primitive_now_utc();
        Some(submission.clone())
    }
}
