//! Per-operation circuit breaker guarding embed calls in the Chunking Pipeline
//! (spec.md §4.9, §5): opens after `threshold` consecutive failures within
//! `window`, half-opens after the window elapses, admits up to
//! `half_open_probes` attempts before fully closing or re-opening.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct OperationState {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probes_used: u32,
}

impl OperationState {
    fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probes_used: 0,
        }
    }
}

pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    half_open_probes: u32,
    operations: Mutex<HashMap<String, OperationState>>,
}

/// Whether a call should proceed, and if not, why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window_secs: u64, half_open_probes: u32) -> Self {
        Self {
            threshold,
            window: Duration::from_secs(window_secs),
            half_open_probes,
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Call before attempting `operation`. Transitions `open -> half_open`
    /// once the window has elapsed.
    pub fn admit(&self, operation: &str) -> Admission {
        let mut operations = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        let entry = operations
            .entry(operation.to_string())
            .or_insert_with(OperationState::new);

        match entry.state {
            State::Closed => Admission::Admitted,
            State::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or(self.window);
                if elapsed >= self.window {
                    entry.state = State::HalfOpen;
                    entry.half_open_probes_used = 1;
                    Admission::Admitted
                } else {
                    Admission::Rejected
                }
            }
            State::HalfOpen => {
                if entry.half_open_probes_used < self.half_open_probes {
                    entry.half_open_probes_used += 1;
                    Admission::Admitted
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    pub fn record_success(&self, operation: &str) {
        let mut operations = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        let entry = operations
            .entry(operation.to_string())
            .or_insert_with(OperationState::new);
        entry.state = State::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
        entry.half_open_probes_used = 0;
    }

    pub fn record_failure(&self, operation: &str) {
        let mut operations = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        let entry = operations
            .entry(operation.to_string())
            .or_insert_with(OperationState::new);

        match entry.state {
            State::HalfOpen => {
                entry.state = State::Open;
                entry.opened_at = Some(Instant::now());
                entry.half_open_probes_used = 0;
            }
            State::Closed | State::Open => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                if entry.consecutive_failures >= self.threshold {
                    entry.state = State::Open;
                    entry.opened_at = Some(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, 60, 2);
        assert_eq!(breaker.admit("embed"), Admission::Admitted);
        breaker.record_failure("embed");
        breaker.record_failure("embed");
        assert_eq!(breaker.admit("embed"), Admission::Admitted);
        breaker.record_failure("embed");
        assert_eq!(breaker.admit("embed"), Admission::Rejected);
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(2, 60, 2);
        breaker.record_failure("embed");
        breaker.record_success("embed");
        breaker.record_failure("embed");
        assert_eq!(breaker.admit("embed"), Admission::Admitted);
    }

    #[test]
    fn half_open_failure_reopens_and_stays_rejected_within_window() {
        let breaker = CircuitBreaker::new(1, 60, 2);
        breaker.record_failure("embed");
        assert_eq!(breaker.admit("embed"), Admission::Rejected);
    }
}
