//! Circuit breaker state machine for upstream protection.
//!
//! The breaker samples response outcomes per protected path. When the
//! failure ratio over a rolling window of consecutive samples reaches the
//! configured threshold the breaker opens; after the cool-down it allows a
//! single probe request through before deciding whether to close again.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker configuration, per protected path.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Failure ratio that trips the breaker (0.0..=1.0)
    pub threshold: f64,
    /// Number of consecutive samples the ratio is computed over
    pub samples: u64,
    /// Cool-down before a probe is allowed through an open breaker
    pub return_to_service_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            samples: 10,
            return_to_service_after: Duration::from_secs(60),
        }
    }
}

/// Admission decision for a request arriving at the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAdmission {
    /// Breaker closed, request passes
    Allowed,
    /// Breaker half-open, this request is the single recovery probe
    Probe,
    /// Breaker open, short-circuit with 503
    Rejected,
}

/// State transition produced by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Tripped,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    window: VecDeque<bool>,
    failures: u64,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for a single (path, method) scope.
///
/// State is private to the API snapshot that owns it; a reload recreates
/// breakers in the closed state.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    name: String,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, name: impl Into<String>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: VecDeque::new(),
                failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            name: name.into(),
        }
    }

    /// Decide whether a request may proceed to the upstream.
    pub fn admit(&self) -> BreakerAdmission {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => BreakerAdmission::Allowed,
            State::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.return_to_service_after)
                    .unwrap_or(true);
                if cooled {
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "Circuit breaker half-open, probing upstream");
                    BreakerAdmission::Probe
                } else {
                    BreakerAdmission::Rejected
                }
            }
            State::HalfOpen => {
                if inner.probe_in_flight {
                    BreakerAdmission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    BreakerAdmission::Probe
                }
            }
        }
    }

    /// Record an upstream outcome. Any 5xx counts as a failure.
    ///
    /// Returns the transition this outcome caused, if any, so the caller can
    /// emit the matching notification.
    pub fn record(&self, success: bool) -> Option<BreakerEvent> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                inner.window.push_back(success);
                if !success {
                    inner.failures += 1;
                }
                if inner.window.len() as u64 > self.config.samples {
                    if let Some(old) = inner.window.pop_front() {
                        if !old {
                            inner.failures -= 1;
                        }
                    }
                }
                if inner.window.len() as u64 >= self.config.samples {
                    let ratio = inner.failures as f64 / inner.window.len() as f64;
                    if ratio >= self.config.threshold {
                        inner.state = State::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.window.clear();
                        inner.failures = 0;
                        warn!(breaker = %self.name, ratio = ratio, "Circuit breaker tripped");
                        return Some(BreakerEvent::Tripped);
                    }
                }
                None
            }
            State::HalfOpen => {
                inner.probe_in_flight = false;
                if success {
                    inner.state = State::Closed;
                    inner.window.clear();
                    inner.failures = 0;
                    inner.opened_at = None;
                    info!(breaker = %self.name, "Circuit breaker reset");
                    Some(BreakerEvent::Reset)
                } else {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(breaker = %self.name, "Circuit breaker probe failed, re-opening");
                    Some(BreakerEvent::Tripped)
                }
            }
            // An in-flight request that started before the trip
            State::Open => None,
        }
    }

    /// Whether the breaker currently rejects traffic (open and cooling down).
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == State::Open
            && inner
                .opened_at
                .map(|t| t.elapsed() < self.config.return_to_service_after)
                .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config(samples: u64, threshold: f64) -> BreakerConfig {
        BreakerConfig {
            threshold,
            samples,
            return_to_service_after: Duration::from_millis(50),
        }
    }

    #[test]
    fn trips_after_single_failure_when_samples_is_one() {
        let cb = CircuitBreaker::new(quick_config(1, 0.1), "api:/test:GET");

        assert_eq!(cb.admit(), BreakerAdmission::Allowed);
        assert_eq!(cb.record(false), Some(BreakerEvent::Tripped));
        assert_eq!(cb.admit(), BreakerAdmission::Rejected);
    }

    #[test]
    fn single_probe_after_cooldown() {
        let cb = CircuitBreaker::new(quick_config(1, 0.1), "api:/test:GET");
        cb.record(false);
        assert_eq!(cb.admit(), BreakerAdmission::Rejected);

        std::thread::sleep(Duration::from_millis(60));

        // Exactly one probe goes through; concurrent requests are rejected
        assert_eq!(cb.admit(), BreakerAdmission::Probe);
        assert_eq!(cb.admit(), BreakerAdmission::Rejected);

        // Probe succeeds -> closed again
        assert_eq!(cb.record(true), Some(BreakerEvent::Reset));
        assert_eq!(cb.admit(), BreakerAdmission::Allowed);
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = CircuitBreaker::new(quick_config(1, 0.1), "api:/test:GET");
        cb.record(false);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cb.admit(), BreakerAdmission::Probe);
        assert_eq!(cb.record(false), Some(BreakerEvent::Tripped));
        assert_eq!(cb.admit(), BreakerAdmission::Rejected);
    }

    #[test]
    fn ratio_below_threshold_stays_closed() {
        let cb = CircuitBreaker::new(quick_config(4, 0.75), "api:/x:GET");
        assert_eq!(cb.record(false), None);
        assert_eq!(cb.record(true), None);
        assert_eq!(cb.record(false), None);
        assert_eq!(cb.record(true), None); // 2/4 = 0.5 < 0.75
        assert_eq!(cb.admit(), BreakerAdmission::Allowed);
    }

    #[test]
    fn rolling_window_evicts_old_samples() {
        let cb = CircuitBreaker::new(quick_config(3, 1.0), "api:/y:GET");
        cb.record(false);
        cb.record(false);
        cb.record(true);
        // Window now [false, false, true], ratio 0.66 < 1.0
        assert_eq!(cb.admit(), BreakerAdmission::Allowed);
        cb.record(false);
        cb.record(false);
        // Window [true, false, false] then this failure evicts the success
        assert_eq!(cb.record(false), Some(BreakerEvent::Tripped));
    }
}
