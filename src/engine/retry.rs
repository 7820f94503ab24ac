use std::time::Duration;

use rand::Rng;

use crate::core::config::RetrySettings;
use crate::model::types::ErrorClass;

/// Unknown errors get a single conservative retry regardless of the
/// submission's retry budget.
const UNKNOWN_RETRY_BUDGET: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    RetryAfter(Duration),
    FailPermanently,
}

/// Pure backoff/fail decision table. The gateway never retries; the runner
/// feeds every classified failure through here.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub(crate) fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }

    pub(crate) fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    /// `attempt` is the 1-based number of the attempt that just failed, so a
    /// budget of `max_retries` allows `max_retries + 1` attempts in total.
    pub(crate) fn decide(
        &self,
        class: ErrorClass,
        attempt: u32,
        max_retries: u32,
        retry_after_hint: Option<Duration>,
    ) -> RetryDecision {
        match class {
            ErrorClass::Authentication | ErrorClass::InvalidInput => RetryDecision::FailPermanently,
            ErrorClass::Unknown => {
                if attempt > UNKNOWN_RETRY_BUDGET {
                    RetryDecision::FailPermanently
                } else {
                    RetryDecision::RetryAfter(self.backoff(attempt))
                }
            }
            ErrorClass::Transient => {
                if attempt > max_retries {
                    RetryDecision::FailPermanently
                } else {
                    RetryDecision::RetryAfter(self.backoff(attempt))
                }
            }
            ErrorClass::RateLimited => {
                if attempt > max_retries {
                    RetryDecision::FailPermanently
                } else {
                    // A backend-supplied hint overrides the computed backoff.
                    RetryDecision::RetryAfter(retry_after_hint.unwrap_or_else(|| self.backoff(attempt)))
                }
            }
        }
    }

    /// Exponential backoff with a cap and a small additive jitter so that a
    /// burst of failures does not re-attempt in lockstep.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let capped = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_delay);
        let jitter_ms = capped.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1000), Duration::from_millis(8000))
    }

    fn delay_of(decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::RetryAfter(delay) => delay,
            RetryDecision::FailPermanently => panic!("expected a retry"),
        }
    }

    #[test]
    fn transient_backs_off_exponentially_until_budget() {
        let policy = policy();

        let first = delay_of(policy.decide(ErrorClass::Transient, 1, 3, None));
        assert!((Duration::from_millis(1000)..=Duration::from_millis(1250)).contains(&first));

        let third = delay_of(policy.decide(ErrorClass::Transient, 3, 3, None));
        assert!((Duration::from_millis(4000)..=Duration::from_millis(5000)).contains(&third));

        assert_eq!(policy.decide(ErrorClass::Transient, 4, 3, None), RetryDecision::FailPermanently);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = policy();
        let late = delay_of(policy.decide(ErrorClass::Transient, 30, 64, None));
        assert!(late <= Duration::from_millis(10_000));
    }

    #[test]
    fn rate_limited_honors_hint() {
        let policy = policy();
        let hint = Duration::from_secs(17);
        assert_eq!(
            policy.decide(ErrorClass::RateLimited, 1, 3, Some(hint)),
            RetryDecision::RetryAfter(hint)
        );
        assert_eq!(
            policy.decide(ErrorClass::RateLimited, 4, 3, Some(hint)),
            RetryDecision::FailPermanently
        );
    }

    #[test]
    fn auth_and_invalid_input_fail_immediately() {
        let policy = policy();
        assert_eq!(
            policy.decide(ErrorClass::Authentication, 1, 3, None),
            RetryDecision::FailPermanently
        );
        assert_eq!(
            policy.decide(ErrorClass::InvalidInput, 1, 3, None),
            RetryDecision::FailPermanently
        );
    }

    #[test]
    fn unknown_is_retried_exactly_once() {
        let policy = policy();
        assert!(matches!(
            policy.decide(ErrorClass::Unknown, 1, 5, None),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(policy.decide(ErrorClass::Unknown, 2, 5, None), RetryDecision::FailPermanently);
    }
}
