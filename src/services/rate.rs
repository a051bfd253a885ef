use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Samples older than this are dropped from the window.
const SAMPLE_TTL: Duration = Duration::from_secs(60);

/// Failures within this lookback escalate the delay.
const FAILURE_LOOKBACK: Duration = Duration::from_secs(30);

/// Maximum number of retained samples.
const MAX_SAMPLES: usize = 100;

/// Per-success geometric decay of the delay back toward the base.
const DECAY: f64 = 0.9;

/// Latency thresholds that scale the base delay up.
const SLOW_MS: f64 = 1500.0;
const VERY_SLOW_MS: f64 = 3000.0;

#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: Instant,
    /// None marks a failure observation.
    latency: Option<Duration>,
}

struct Window {
    samples: VecDeque<RateSample>,
    current_delay_ms: f64,
}

/// Tracks recent response latencies and failures and derives an adaptive
/// inter-request delay.
///
/// The remote service's true rate limit is opaque, so the delay is inferred
/// from trend: failures in the recent window escalate it proportionally (up
/// to a cap), high average latency scales it, and successes decay it
/// geometrically back toward the base. AIMD-like, with no hard resets.
pub struct RateObserver {
    inner: Mutex<Window>,
    base_delay_ms: f64,
    max_delay_ms: f64,
}

impl RateObserver {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        let base_delay_ms = base_delay.as_millis() as f64;
        Self {
            inner: Mutex::new(Window {
                samples: VecDeque::with_capacity(MAX_SAMPLES),
                current_delay_ms: base_delay_ms,
            }),
            base_delay_ms,
            max_delay_ms: max_delay.as_millis() as f64,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(window: &mut Window, sample: RateSample) {
        if window.samples.len() == MAX_SAMPLES {
            window.samples.pop_front();
        }
        window.samples.push_back(sample);
    }

    fn prune(window: &mut Window, now: Instant) {
        while let Some(oldest) = window.samples.front() {
            if now.duration_since(oldest.at) > SAMPLE_TTL {
                window.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_success(&self, latency: Duration) {
        let now = Instant::now();
        let mut window = self.lock();
        Self::push(
            &mut window,
            RateSample {
                at: now,
                latency: Some(latency),
            },
        );
        Self::prune(&mut window, now);
        // Geometric decay toward the base delay.
        window.current_delay_ms =
            self.base_delay_ms + (window.current_delay_ms - self.base_delay_ms) * DECAY;
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut window = self.lock();
        Self::push(&mut window, RateSample { at: now, latency: None });
        Self::prune(&mut window, now);
    }

    /// Delay to respect before the next request.
    pub fn optimal_delay(&self) -> Duration {
        let now = Instant::now();
        let mut window = self.lock();
        Self::prune(&mut window, now);

        let recent_failures = window
            .samples
            .iter()
            .filter(|s| s.latency.is_none() && now.duration_since(s.at) <= FAILURE_LOOKBACK)
            .count();

        let latencies: Vec<f64> = window
            .samples
            .iter()
            .filter_map(|s| s.latency)
            .map(|l| l.as_millis() as f64)
            .collect();
        let mean_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let mut delay = window.current_delay_ms;
        if recent_failures > 0 {
            delay = delay.max(self.base_delay_ms * (1 + recent_failures) as f64);
        }
        if mean_latency > VERY_SLOW_MS {
            delay = delay.max(self.base_delay_ms * 3.0);
        } else if mean_latency > SLOW_MS {
            delay = delay.max(self.base_delay_ms * 2.0);
        }
        delay = delay.min(self.max_delay_ms);
        window.current_delay_ms = delay;

        Duration::from_millis(delay.round() as u64)
    }
}
