use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;

use crate::services::breaker::CircuitBreaker;
use crate::services::rate::RateObserver;

/// Poll interval while the pause gate is set.
const PAUSE_POLL: Duration = Duration::from_millis(250);

/// Minimum wait while the breaker blocks with no known cooldown.
const BLOCK_POLL: Duration = Duration::from_millis(250);

/// A granted unit of permission to have one transform in flight. Dropping it
/// releases the slot; release happens on every exit path.
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        metrics::gauge!("optimize_slots_in_use").decrement(1.0);
    }
}

/// Bounded pool of execution slots gating how many remote calls may be
/// outstanding at once.
///
/// `acquire` suspends until a slot is free, the circuit breaker does not
/// block, and no out-of-band pause is active, then applies the rate
/// observer's adaptive delay before handing the slot out. Waiters queue FIFO
/// on the semaphore. Acquisition never fails; it only delays.
pub struct ConcurrencyGovernor {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    paused: AtomicBool,
    breaker: Arc<CircuitBreaker>,
    rate: Arc<RateObserver>,
}

impl ConcurrencyGovernor {
    pub fn new(max_concurrent: usize, breaker: Arc<CircuitBreaker>, rate: Arc<RateObserver>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            limit: AtomicUsize::new(max_concurrent),
            paused: AtomicBool::new(false),
            breaker,
            rate,
        }
    }

    pub async fn acquire(&self) -> Slot {
        // The gates are checked while holding a permit, so a waiter that
        // queued before the breaker opened or a pause was set cannot slip
        // through when a slot frees up mid-incident.
        let permit = loop {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("governor semaphore is never closed");

            if self.paused.load(Ordering::Acquire) {
                drop(permit);
                sleep(PAUSE_POLL).await;
                continue;
            }
            if self.breaker.should_block() {
                drop(permit);
                let wait = self.breaker.cooldown_remaining().max(BLOCK_POLL);
                tracing::debug!(wait_ms = wait.as_millis() as u64, "Blocked by circuit breaker");
                sleep(wait).await;
                continue;
            }
            break permit;
        };

        let delay = self.rate.optimal_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        metrics::gauge!("optimize_slots_in_use").increment(1.0);
        Slot { _permit: permit }
    }

    /// Change the slot count at runtime. Growing wakes queued waiters
    /// immediately; shrinking retires slots as current holders release them.
    pub fn resize(&self, new_limit: usize) {
        let new_limit = new_limit.max(1);
        let old = self.limit.swap(new_limit, Ordering::AcqRel);
        if new_limit > old {
            self.semaphore.add_permits(new_limit - old);
        } else {
            for _ in 0..old - new_limit {
                let semaphore = Arc::clone(&self.semaphore);
                tokio::spawn(async move {
                    if let Ok(permit) = semaphore.acquire_owned().await {
                        permit.forget();
                    }
                });
            }
        }
        tracing::info!(old_limit = old, new_limit, "Concurrency limit resized");
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Out-of-band backpressure gate (e.g. memory pressure). While set, no
    /// new slots are granted; held slots are unaffected.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn governor(limit: usize) -> Arc<ConcurrencyGovernor> {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(30)));
        let rate = Arc::new(RateObserver::new(Duration::ZERO, Duration::from_secs(2)));
        Arc::new(ConcurrencyGovernor::new(limit, breaker, rate))
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_limit() {
        let gov = governor(3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let gov = Arc::clone(&gov);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _slot = gov.acquire().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_slot_released_on_panic_path() {
        let gov = governor(1);
        let gov2 = Arc::clone(&gov);
        let handle = tokio::spawn(async move {
            let _slot = gov2.acquire().await;
            panic!("worker died");
        });
        assert!(handle.await.is_err());
        // The slot must have been released by the drop despite the panic.
        let _slot = gov.acquire().await;
    }

    #[tokio::test]
    async fn test_resize_up_wakes_waiters() {
        let gov = governor(1);
        let held = gov.acquire().await;

        let gov2 = Arc::clone(&gov);
        let waiter = tokio::spawn(async move {
            let _slot = gov2.acquire().await;
        });
        sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        gov.resize(2);
        waiter.await.unwrap();
        drop(held);
    }

    #[tokio::test]
    async fn test_open_breaker_delays_acquisition() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_millis(300)));
        let rate = Arc::new(RateObserver::new(Duration::ZERO, Duration::from_secs(2)));
        let gov = ConcurrencyGovernor::new(2, Arc::clone(&breaker), rate);

        breaker.record_failure();
        let started = Instant::now();
        let _slot = gov.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_queued_waiter_honors_breaker_opened_while_waiting() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_millis(200)));
        let rate = Arc::new(RateObserver::new(Duration::ZERO, Duration::from_secs(2)));
        let gov = Arc::new(ConcurrencyGovernor::new(1, Arc::clone(&breaker), rate));

        let held = gov.acquire().await;
        let gov2 = Arc::clone(&gov);
        let started = Instant::now();
        let waiter = tokio::spawn(async move {
            let _slot = gov2.acquire().await;
            started.elapsed()
        });
        sleep(Duration::from_millis(50)).await;

        // The breaker opens while the waiter is already queued; releasing
        // the slot must not let it through before the cooldown elapses.
        breaker.record_failure();
        drop(held);

        let waited = waiter.await.unwrap();
        assert!(
            waited >= Duration::from_millis(150),
            "waiter got a slot during an open circuit after {waited:?}"
        );
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let gov = governor(2);
        gov.pause();

        let gov2 = Arc::clone(&gov);
        let waiter = tokio::spawn(async move {
            let _slot = gov2.acquire().await;
        });
        sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        gov.resume();
        waiter.await.unwrap();
    }
}
