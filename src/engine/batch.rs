use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::model::records::Submission;
use crate::model::types::SubmissionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub(crate) struct ProgressSnapshot {
    pub(crate) total: usize,
    pub(crate) completed: usize,
    pub(crate) failed: usize,
    pub(crate) pending: usize,
    pub(crate) percent: f64,
}

#[derive(Debug, Default)]
struct ProgressInner {
    total: usize,
    /// Terminal status per submission; the map makes replayed terminal
    /// notifications idempotent.
    terminal: HashMap<String, SubmissionStatus>,
}

/// Batch-level progress counters. Fed by the runner as submissions settle,
/// so reading progress never walks every submission in the ledger.
#[derive(Debug, Default)]
pub(crate) struct ProgressAggregator {
    inner: Mutex<ProgressInner>,
}

impl ProgressAggregator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_submissions(&self, count: usize) {
        let mut inner = self.inner.lock().expect("progress lock poisoned");
        inner.total += count;
    }

    pub(crate) fn record_terminal(&self, submission_id: &str, status: SubmissionStatus) {
        if !status.is_terminal() {
            return;
        }
        let mut inner = self.inner.lock().expect("progress lock poisoned");
        inner.terminal.insert(submission_id.to_string(), status);
    }

    /// Manual retry moves a submission back out of the terminal buckets.
    pub(crate) fn reopen(&self, submission_id: &str) {
        let mut inner = self.inner.lock().expect("progress lock poisoned");
        inner.terminal.remove(submission_id);
    }

    pub(crate) fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.inner.lock().expect("progress lock poisoned");
        let completed = inner
            .terminal
            .values()
            .filter(|status| **status == SubmissionStatus::Completed)
            .count();
        let failed = inner.terminal.len() - completed;
        let pending = inner.total.saturating_sub(inner.terminal.len());
        let percent = if inner.total == 0 {
            0.0
        } else {
            inner.terminal.len() as f64 * 100.0 / inner.total as f64
        };
        ProgressSnapshot { total: inner.total, completed, failed, pending, percent }
    }

    /// Rebuilds the counters from ledger snapshots, used after restart
    /// recovery when terminal notifications may have been lost.
    pub(crate) fn reconcile(&self, submissions: &[Submission]) {
        let mut inner = self.inner.lock().expect("progress lock poisoned");
        inner.total = submissions.len();
        inner.terminal.clear();
        for submission in submissions {
            if submission.status.is_terminal() {
                inner.terminal.insert(submission.id.clone(), submission.status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_reads_zero_percent() {
        let progress = ProgressAggregator::new();
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.percent, 0.0);
    }

    #[test]
    fn counts_split_by_terminal_status() {
        let progress = ProgressAggregator::new();
        progress.add_submissions(4);
        progress.record_terminal("s1", SubmissionStatus::Completed);
        progress.record_terminal("s2", SubmissionStatus::Failed);
        progress.record_terminal("s3", SubmissionStatus::PartiallyFailed);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.percent, 75.0);
    }

    #[test]
    fn replayed_terminal_notifications_count_once() {
        let progress = ProgressAggregator::new();
        progress.add_submissions(2);
        progress.record_terminal("s1", SubmissionStatus::Completed);
        progress.record_terminal("s1", SubmissionStatus::Completed);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.pending, 1);
    }

    #[test]
    fn non_terminal_statuses_are_ignored() {
        let progress = ProgressAggregator::new();
        progress.add_submissions(1);
        progress.record_terminal("s1", SubmissionStatus::Dispatched);
        assert_eq!(progress.snapshot().pending, 1);
    }

    #[test]
    fn reopen_returns_a_submission_to_pending() {
        let progress = ProgressAggregator::new();
        progress.add_submissions(2);
        progress.record_terminal("s1", SubmissionStatus::Failed);
        progress.record_terminal("s2", SubmissionStatus::Completed);
        assert_eq!(progress.snapshot().failed, 1);

        progress.reopen("s1");
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.pending, 1);
    }
}
