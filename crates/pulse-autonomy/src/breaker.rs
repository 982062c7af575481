use chrono::{DateTime, Utc};
use pulse_config::CircuitBreakerConfig;
use pulse_core::{CircuitBreakerState, CircuitStatus};
use std::time::Duration;
use tracing::{info, warn};

/// Capability key for the reasoning engine's breaker.
pub const REASONING_ENGINE: &str = "reasoning_engine";

/// Three-state circuit breaker for one capability.
///
/// Time is passed in rather than read from a monotonic clock so the state can be
/// persisted and restored across restarts.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
    error_threshold: u32,
    reset_timeout: chrono::Duration,
    half_open_max_calls: u32,
}

impl CircuitBreaker {
    pub fn new(capability: &str, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Self {
        Self::from_state(CircuitBreakerState::closed(capability, now), config)
    }

    /// Resume from persisted state.
    pub fn from_state(state: CircuitBreakerState, config: &CircuitBreakerConfig) -> Self {
        Self {
            state,
            error_threshold: config.error_threshold.max(1),
            reset_timeout: chrono::Duration::seconds(config.reset_timeout as i64),
            half_open_max_calls: config.half_open_max_calls.max(1),
        }
    }

    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    pub fn status(&self) -> CircuitStatus {
        self.state.status
    }

    pub fn capability(&self) -> &str {
        &self.state.capability
    }

    /// Check whether a call may go through. Consumes a probe slot when half-open.
    pub fn allow_request_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.state.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => {
                if self.timeout_elapsed(now) {
                    // Transition to half-open and let the first probe through.
                    self.transition(CircuitStatus::HalfOpen, now);
                    self.state.half_open_remaining = self.half_open_max_calls - 1;
                    self.state.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitStatus::HalfOpen => {
                if self.state.half_open_remaining > 0 {
                    self.state.half_open_remaining -= 1;
                    true
                } else if self.timeout_elapsed(now) {
                    // A probe never reported back (e.g. crash mid-tick). Re-arm.
                    self.state.last_state_change = now;
                    self.state.half_open_remaining = self.half_open_max_calls - 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success_at(&mut self, now: DateTime<Utc>) {
        match self.state.status {
            CircuitStatus::Closed => {
                self.state.consecutive_failures = 0;
            }
            CircuitStatus::HalfOpen => {
                self.state.half_open_successes += 1;
                if self.state.half_open_successes >= self.half_open_max_calls {
                    info!(capability = %self.state.capability, "circuit closed after successful probes");
                    self.transition(CircuitStatus::Closed, now);
                    self.state.consecutive_failures = 0;
                    self.state.half_open_remaining = 0;
                    self.state.half_open_successes = 0;
                }
            }
            // A call admitted before the breaker opened; does not close it.
            CircuitStatus::Open => {}
        }
    }

    pub fn record_failure_at(&mut self, now: DateTime<Utc>) {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        match self.state.status {
            CircuitStatus::Closed => {
                if self.state.consecutive_failures >= self.error_threshold {
                    warn!(
                        capability = %self.state.capability,
                        failures = self.state.consecutive_failures,
                        "circuit opened"
                    );
                    self.transition(CircuitStatus::Open, now);
                }
            }
            CircuitStatus::HalfOpen => {
                warn!(capability = %self.state.capability, "probe failed, circuit re-opened");
                self.transition(CircuitStatus::Open, now);
                self.state.half_open_remaining = 0;
                self.state.half_open_successes = 0;
            }
            CircuitStatus::Open => {}
        }
    }

    /// How long until a call could be admitted again. Zero when one would be now.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        match self.state.status {
            CircuitStatus::Closed => Duration::ZERO,
            CircuitStatus::HalfOpen if self.state.half_open_remaining > 0 => Duration::ZERO,
            CircuitStatus::Open | CircuitStatus::HalfOpen => {
                let ready_at = self.state.last_state_change + self.reset_timeout;
                (ready_at - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }

    fn timeout_elapsed(&self, now: DateTime<Utc>) -> bool {
        now - self.state.last_state_change >= self.reset_timeout
    }

    fn transition(&mut self, to: CircuitStatus, now: DateTime<Utc>) {
        self.state.status = to;
        self.state.last_state_change = now;
    }
}
