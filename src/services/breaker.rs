use std::sync::Mutex;
use std::time::{Duration, Instant};

/// State of the breaker circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// In HalfOpen, whether the single trial request is outstanding.
    trial_in_flight: bool,
}

/// Stops issuing calls after sustained failure to avoid hammering an outage.
///
/// Closed counts consecutive failures and opens at the threshold. Open blocks
/// all work until the cooldown elapses, then admits exactly one trial request
/// (HalfOpen). Trial success closes the circuit and resets the count; trial
/// failure re-opens it with a fresh cooldown.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True iff the caller must not issue a request right now. After the
    /// cooldown the first caller through becomes the HalfOpen trial; everyone
    /// else keeps blocking until that trial resolves.
    pub fn should_block(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("Circuit breaker half-open, admitting trial request");
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    true
                } else {
                    inner.trial_in_flight = true;
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// A request resolved without saying anything about service health (for
    /// example it failed local validation before reaching the service).
    /// Frees a half-open trial without counting a success or a failure, so
    /// the next caller can run the trial instead.
    pub fn record_neutral(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                tracing::warn!("Circuit breaker trial failed, re-opened");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        consecutive_failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Time left until an Open circuit admits its trial, zero otherwise.
    pub fn cooldown_remaining(&self) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => self.cooldown.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.should_block());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.should_block());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);
        breaker.record_failure();
        // Cooldown of zero: first caller becomes the trial.
        assert!(!breaker.should_block());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Everyone else stays blocked while the trial is outstanding.
        assert!(breaker.should_block());
        assert!(breaker.should_block());
    }

    #[test]
    fn test_neutral_outcome_releases_the_trial() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);
        breaker.record_failure();
        assert!(!breaker.should_block());
        // The trial never reached the service; it says nothing about health.
        breaker.record_neutral();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // The trial slot is free again for the next caller.
        assert!(!breaker.should_block());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trial_success_closes() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);
        breaker.record_failure();
        assert!(!breaker.should_block());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.should_block());
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure();
        // Force the cooldown to look elapsed.
        {
            let mut inner = breaker.lock();
            inner.opened_at = Some(Instant::now() - Duration::from_secs(31));
        }
        assert!(!breaker.should_block());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.should_block());
        assert!(breaker.cooldown_remaining() > Duration::from_secs(29));
    }
}
