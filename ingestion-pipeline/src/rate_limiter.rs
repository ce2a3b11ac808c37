//! Sliding-window rate limiter shared by the Ingestion Queue and the Chunking
//! Pipeline for all outbound LLM/embedding calls (spec.md §4.9, §5: "a single
//! sliding-window counter for all external LLM/embedding calls").

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

pub struct SlidingWindowRateLimiter {
    window: Duration,
    rpm_budget: u32,
    avg_requests_per_object: f64,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(rpm_budget: u32, avg_requests_per_object: f64) -> Self {
        Self {
            window: Duration::from_secs(60),
            rpm_budget,
            avg_requests_per_object,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current requests-per-minute observed in the trailing 60s window.
    pub fn current_rpm(&self) -> u32 {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        self.prune(&mut timestamps, now);
        timestamps.len() as u32
    }

    /// How many more objects (each costing `avg_requests_per_object` calls on
    /// average) can be started without exceeding `rpm_budget` (spec.md §4.9 step 2).
    pub fn headroom_objects(&self) -> u32 {
        let current = self.current_rpm();
        let remaining = self.rpm_budget.saturating_sub(current);
        if self.avg_requests_per_object <= 0.0 {
            return remaining;
        }
        ((f64::from(remaining)) / self.avg_requests_per_object).floor() as u32
    }

    /// Records that `count` external requests were just issued.
    pub fn record(&self, count: u32) {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        self.prune(&mut timestamps, now);
        for _ in 0..count {
            timestamps.push_back(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headroom_shrinks_as_requests_are_recorded() {
        let limiter = SlidingWindowRateLimiter::new(100, 2.0);
        assert_eq!(limiter.headroom_objects(), 50);
        limiter.record(50);
        assert_eq!(limiter.current_rpm(), 50);
        assert_eq!(limiter.headroom_objects(), 25);
    }

    #[test]
    fn zero_avg_requests_returns_raw_remaining() {
        let limiter = SlidingWindowRateLimiter::new(10, 0.0);
        assert_eq!(limiter.headroom_objects(), 10);
    }
}
