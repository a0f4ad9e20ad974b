//! Per-host three-state circuit breaker: CLOSED / OPEN / HALF_OPEN, with
//! failure-counting, timed recovery, and a bounded half-open probe count.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use empresa_core::BreakerState;
use tracing::{info, warn};

pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_tests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 12,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_tests: 3,
        }
    }
}

struct HostHealth {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl Default for HostHealth {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
        }
    }
}

/// `⌈half_open_max_tests / 2⌉` — the success quorum needed to fully close
/// the breaker from HALF_OPEN.
fn success_quorum(half_open_max_tests: u32) -> u32 {
    half_open_max_tests.div_ceil(2)
}

pub struct CircuitBreaker {
    hosts: DashMap<String, Mutex<HostHealth>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            config,
        }
    }

    /// Returns `true` if a request for `host` should proceed. A `CLOSED`
    /// host always proceeds; an `OPEN` host proceeds only after
    /// `recovery_timeout` has elapsed (transitioning to `HALF_OPEN` on the
    /// way); a `HALF_OPEN` host admits at most `half_open_max_tests`
    /// concurrent probes, rejecting the rest.
    pub fn should_attempt(&self, host: &str) -> bool {
        let entry = self.hosts.entry(host.to_string()).or_default();
        let mut health = entry.lock().unwrap();
        match health.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = health.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    health.state = BreakerState::HalfOpen;
                    health.half_open_in_flight = 1;
                    health.half_open_successes = 0;
                    info!(host, "circuit breaker half-open after recovery timeout");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if health.half_open_in_flight < self.config.half_open_max_tests {
                    health.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, host: &str) {
        let entry = self.hosts.entry(host.to_string()).or_default();
        let mut health = entry.lock().unwrap();
        match health.state {
            BreakerState::Closed => {
                health.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                health.half_open_in_flight = health.half_open_in_flight.saturating_sub(1);
                health.half_open_successes += 1;
                if health.half_open_successes >= success_quorum(self.config.half_open_max_tests) {
                    health.state = BreakerState::Closed;
                    health.consecutive_failures = 0;
                    health.opened_at = None;
                    info!(host, "circuit breaker closed after half-open success quorum");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Any single failure while `HALF_OPEN` immediately reopens the
    /// breaker with a fresh `opened_at`.
    pub fn record_failure(&self, host: &str) {
        let entry = self.hosts.entry(host.to_string()).or_default();
        let mut health = entry.lock().unwrap();
        match health.state {
            BreakerState::Closed => {
                health.consecutive_failures += 1;
                if health.consecutive_failures >= self.config.failure_threshold {
                    health.state = BreakerState::Open;
                    health.opened_at = Some(Instant::now());
                    warn!(host, failures = health.consecutive_failures, "circuit breaker opened");
                }
            }
            BreakerState::HalfOpen => {
                health.half_open_in_flight = health.half_open_in_flight.saturating_sub(1);
                health.state = BreakerState::Open;
                health.opened_at = Some(Instant::now());
                health.half_open_successes = 0;
                warn!(host, "circuit breaker reopened during half-open probe");
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self, host: &str) -> BreakerState {
        self.hosts
            .get(host)
            .map(|h| h.lock().unwrap().state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn open_hosts(&self) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|e| e.value().lock().unwrap().state == BreakerState::Open)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn state_counts(&self) -> (usize, usize, usize) {
        let mut closed = 0;
        let mut half_open = 0;
        let mut open = 0;
        for e in self.hosts.iter() {
            match e.value().lock().unwrap().state {
                BreakerState::Closed => closed += 1,
                BreakerState::HalfOpen => half_open += 1,
                BreakerState::Open => open += 1,
            }
        }
        (closed, half_open, open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_tests: 3,
        });
        for _ in 0..2 {
            assert!(cb.should_attempt("a.com"));
            cb.record_failure("a.com");
        }
        assert!(cb.should_attempt("a.com"));
        cb.record_failure("a.com");
        assert_eq!(cb.state("a.com"), BreakerState::Open);
        assert!(!cb.should_attempt("a.com"));
    }

    #[test]
    fn single_failure_opens_breaker_with_threshold_one() {
        let cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_tests: 3,
        });
        assert!(cb.should_attempt("a.com"));
        cb.record_failure("a.com");
        assert_eq!(cb.state("a.com"), BreakerState::Open);
        assert!(!cb.should_attempt("a.com"));
    }

    #[test]
    fn half_open_closes_on_success_majority_not_first_success() {
        let cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
            half_open_max_tests: 3,
        });
        cb.record_failure("a.com");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.should_attempt("a.com"));
        assert_eq!(cb.state("a.com"), BreakerState::HalfOpen);
        assert!(cb.should_attempt("a.com"));
        assert!(cb.should_attempt("a.com"));

        cb.record_success("a.com");
        assert_eq!(cb.state("a.com"), BreakerState::HalfOpen);
        cb.record_success("a.com");
        assert_eq!(cb.state("a.com"), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
            half_open_max_tests: 3,
        });
        cb.record_failure("a.com");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.should_attempt("a.com"));
        cb.record_failure("a.com");
        assert_eq!(cb.state("a.com"), BreakerState::Open);
    }

    #[test]
    fn half_open_rejects_excess_arrivals_past_cap() {
        let cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
            half_open_max_tests: 2,
        });
        cb.record_failure("a.com");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.should_attempt("a.com"));
        assert!(cb.should_attempt("a.com"));
        assert!(!cb.should_attempt("a.com"));
    }
}
