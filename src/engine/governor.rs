use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};

/// Bounds in-flight calls against one backend identity. Waiters queue FIFO in
/// the tokio semaphore, so no submission starves under sustained load. The
/// governor is pure concurrency control; it knows nothing about retries,
/// jobs, or batches.
pub(crate) struct RateGovernor {
    backend: String,
    slots: Option<Arc<Semaphore>>,
    pacing: Option<Pacing>,
}

struct Pacing {
    min_interval: Duration,
    next_start: Mutex<Option<Instant>>,
}

/// RAII slot; dropping it frees the backend slot.
pub(crate) struct GovernorPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl RateGovernor {
    pub(crate) fn new(
        backend: impl Into<String>,
        capacity: Option<usize>,
        min_interval: Option<Duration>,
    ) -> Self {
        Self {
            backend: backend.into(),
            slots: capacity.map(|n| Arc::new(Semaphore::new(n))),
            pacing: min_interval
                .filter(|interval| !interval.is_zero())
                .map(|interval| Pacing { min_interval: interval, next_start: Mutex::new(None) }),
        }
    }

    /// Blocks until a slot is free and, when pacing is configured, until this
    /// caller's reserved start time arrives.
    pub(crate) async fn acquire(&self) -> GovernorPermit {
        let permit = match &self.slots {
            Some(slots) => {
                // The semaphore is never closed for the governor's lifetime.
                Some(slots.clone().acquire_owned().await.expect("governor semaphore closed"))
            }
            None => None,
        };

        if let Some(pacing) = &self.pacing {
            let start_at = {
                let mut next_start = pacing.next_start.lock().await;
                let now = Instant::now();
                let start_at = next_start.map_or(now, |at| at.max(now));
                *next_start = Some(start_at + pacing.min_interval);
                start_at
            };
            let wait = start_at.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                tracing::trace!(
                    backend = %self.backend,
                    wait_ms = wait.as_millis() as u64,
                    "Pacing backend call"
                );
            }
            sleep_until(start_at).await;
        }

        GovernorPermit { _permit: permit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn run_load(governor: Arc<RateGovernor>, tasks: usize) -> usize {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(tasks);
        for _ in 0..tasks {
            let governor = governor.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _slot = governor.acquire().await;
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.expect("governor task");
        }

        peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn capacity_bounds_concurrency_under_load() {
        let governor = Arc::new(RateGovernor::new("capped", Some(3), None));
        let peak = run_load(governor, 30).await;
        assert!(peak <= 3, "peak concurrency {peak} exceeded capacity 3");
    }

    #[tokio::test]
    async fn unbounded_governor_admits_everyone() {
        let governor = Arc::new(RateGovernor::new("open", None, None));
        let peak = run_load(governor, 16).await;
        assert!(peak > 3, "expected unbounded governor to admit many, peak was {peak}");
    }

    #[tokio::test]
    async fn pacing_spaces_out_call_starts() {
        let governor = Arc::new(RateGovernor::new("paced", None, Some(Duration::from_millis(50))));

        let started = Instant::now();
        for _ in 0..4 {
            let _slot = governor.acquire().await;
        }
        let elapsed = started.elapsed();

        // First call starts immediately, the next three are spaced 50ms apart.
        assert!(elapsed >= Duration::from_millis(140), "calls were not paced: {elapsed:?}");
    }
}
