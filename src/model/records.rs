use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::PrimitiveDateTime;

use crate::model::types::{ErrorClass, SubmissionStatus};

pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TokenUsage {
    pub(crate) prompt_tokens: Option<u64>,
    pub(crate) completion_tokens: Option<u64>,
    pub(crate) total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub(crate) enum OutcomeKind {
    Success { grade: Value, usage: Option<TokenUsage> },
    Failure { class: ErrorClass, message: String, permanent: bool },
}

/// One backend attempt's recorded result. Outcomes are append-only on the
/// submission; a retried attempt appends a new record and never mutates a
/// prior one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GradeOutcome {
    pub(crate) backend: String,
    pub(crate) model: String,
    pub(crate) attempt: u32,
    pub(crate) kind: OutcomeKind,
    pub(crate) recorded_at: PrimitiveDateTime,
}

impl GradeOutcome {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self.kind, OutcomeKind::Success { .. })
    }

    /// Success and permanent failure are both terminal for a backend branch.
    pub(crate) fn is_terminal(&self) -> bool {
        match &self.kind {
            OutcomeKind::Success { .. } => true,
            OutcomeKind::Failure { permanent, .. } => *permanent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Submission {
    pub(crate) id: String,
    pub(crate) job_id: String,
    pub(crate) text: String,
    pub(crate) status: SubmissionStatus,
    pub(crate) outcomes: Vec<GradeOutcome>,
    /// Attempts consumed per backend in the current retry epoch. A manual
    /// retry zeroes the counters of the failed backends only.
    pub(crate) epoch_attempts: HashMap<String, u32>,
    pub(crate) max_retries: u32,
    pub(crate) last_error_class: Option<ErrorClass>,
    pub(crate) last_error_message: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

impl Submission {
    pub(crate) fn new(id: String, job_id: String, text: String, now: PrimitiveDateTime) -> Self {
        Self {
            id,
            job_id,
            text,
            status: SubmissionStatus::Pending,
            outcomes: Vec::new(),
            epoch_attempts: HashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            last_error_class: None,
            last_error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn epoch_attempts_for(&self, backend: &str) -> u32 {
        self.epoch_attempts.get(backend).copied().unwrap_or(0)
    }

    /// Total attempts ever made against a backend; attempt numbers in the
    /// audit trail keep increasing across manual-retry epochs.
    pub(crate) fn total_attempts_for(&self, backend: &str) -> u32 {
        self.outcomes.iter().filter(|outcome| outcome.backend == backend).count() as u32
    }

    pub(crate) fn latest_outcome_for(&self, backend: &str) -> Option<&GradeOutcome> {
        self.outcomes.iter().rev().find(|outcome| outcome.backend == backend)
    }

    pub(crate) fn backend_terminal(&self, backend: &str) -> bool {
        self.latest_outcome_for(backend).map(GradeOutcome::is_terminal).unwrap_or(false)
    }

    pub(crate) fn backend_succeeded(&self, backend: &str) -> bool {
        self.latest_outcome_for(backend).map(GradeOutcome::is_success).unwrap_or(false)
    }

    /// Terminal status once every requested backend branch is terminal:
    /// all successes => Completed, all permanent failures => Failed,
    /// mixed => PartiallyFailed. None while any branch is still open.
    pub(crate) fn derive_terminal_status(&self, backends: &[String]) -> Option<SubmissionStatus> {
        if backends.is_empty() || !backends.iter().all(|backend| self.backend_terminal(backend)) {
            return None;
        }

        let successes = backends.iter().filter(|backend| self.backend_succeeded(backend)).count();
        Some(if successes == backends.len() {
            SubmissionStatus::Completed
        } else if successes == 0 {
            SubmissionStatus::Failed
        } else {
            SubmissionStatus::PartiallyFailed
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ModelParams {
    pub(crate) model: Option<String>,
    pub(crate) max_tokens: Option<u32>,
    pub(crate) temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobConfig {
    pub(crate) prompt: String,
    /// Backend identities to grade against; more than one means comparison
    /// mode (one governed branch per backend).
    pub(crate) backends: Vec<String>,
    pub(crate) params: ModelParams,
    /// Marking scheme reference, opaque to the engine.
    pub(crate) marking_scheme: Value,
    pub(crate) max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Job {
    pub(crate) id: String,
    pub(crate) batch_id: String,
    pub(crate) name: String,
    pub(crate) config: JobConfig,
    pub(crate) submission_ids: Vec<String>,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Batch {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) deadline: Option<PrimitiveDateTime>,
    pub(crate) job_ids: Vec<String>,
    pub(crate) created_at: PrimitiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::primitive_now_utc;

    fn outcome(backend: &str, attempt: u32, kind: OutcomeKind) -> GradeOutcome {
        GradeOutcome {
            backend: backend.to_string(),
            model: "test-model".to_string(),
            attempt,
            kind,
            recorded_at: primitive_now_utc(),
        }
    }

    fn success(backend: &str, attempt: u32) -> GradeOutcome {
        outcome(backend, attempt, OutcomeKind::Success { grade: serde_json::json!({}), usage: None })
    }

    fn failure(backend: &str, attempt: u32, permanent: bool) -> GradeOutcome {
        outcome(
            backend,
            attempt,
            OutcomeKind::Failure {
                class: ErrorClass::Transient,
                message: "boom".to_string(),
                permanent,
            },
        )
    }

    fn submission_with(outcomes: Vec<GradeOutcome>) -> Submission {
        let now = primitive_now_utc();
        let mut submission =
            Submission::new("s1".to_string(), "j1".to_string(), "text".to_string(), now);
        submission.outcomes = outcomes;
        submission
    }

    #[test]
    fn open_branch_has_no_terminal_status() {
        let submission = submission_with(vec![failure("a", 1, false)]);
        assert_eq!(submission.derive_terminal_status(&["a".to_string()]), None);
    }

    #[test]
    fn all_successes_complete() {
        let submission = submission_with(vec![success("a", 1), success("b", 1)]);
        let backends = vec!["a".to_string(), "b".to_string()];
        assert_eq!(submission.derive_terminal_status(&backends), Some(SubmissionStatus::Completed));
    }

    #[test]
    fn mixed_outcomes_partially_fail() {
        let submission = submission_with(vec![success("a", 1), failure("b", 1, true)]);
        let backends = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            submission.derive_terminal_status(&backends),
            Some(SubmissionStatus::PartiallyFailed)
        );
    }

    #[test]
    fn all_permanent_failures_fail() {
        let submission = submission_with(vec![failure("a", 1, true)]);
        assert_eq!(
            submission.derive_terminal_status(&["a".to_string()]),
            Some(SubmissionStatus::Failed)
        );
    }

    #[test]
    fn latest_outcome_wins_per_backend() {
        let submission = submission_with(vec![failure("a", 1, false), success("a", 2)]);
        assert!(submission.backend_succeeded("a"));
        assert_eq!(submission.total_attempts_for("a"), 2);
    }
}
