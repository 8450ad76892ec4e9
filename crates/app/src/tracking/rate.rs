//! Rolling throughput estimation for the tracking worker.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(2);

/// Sliding-window samples-per-second estimator.
///
/// Samples older than the window age out, so the estimate converges to the
/// true input rate under steady load and recovers after a gap.
pub(crate) struct RateMeter {
    window: Duration,
    samples: VecDeque<Instant>,
}

impl RateMeter {
    pub(crate) fn new() -> Self {
        Self::with_window(DEFAULT_RATE_WINDOW)
    }

    pub(crate) fn with_window(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub(crate) fn record(&mut self, at: Instant) {
        self.samples.push_back(at);
        self.evict(at);
    }

    /// Current samples-per-second estimate. Non-negative; zero until two
    /// samples fall inside the window.
    pub(crate) fn current_rate(&mut self, now: Instant) -> f64 {
        self.evict(now);
        let (Some(oldest), Some(newest)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }
        let span = newest.duration_since(*oldest);
        if span.is_zero() {
            return 0.0;
        }
        (self.samples.len() - 1) as f64 / span.as_secs_f64()
    }

    fn evict(&mut self, now: Instant) {
        let Some(horizon) = now.checked_sub(self.window) else {
            return;
        };
        while self
            .samples
            .front()
            .is_some_and(|sample| *sample < horizon)
        {
            self.samples.pop_front();
        }
    }
}
