//! Retry policy execution and circuit breaking
//!
//! Retries re-dispatch the failed step with exponential backoff; the
//! replacement output goes through `ExecutionContext::set_step_output`,
//! which subtracts the superseded attempt's tokens and time. The circuit
//! breaker sits at the component level and short-circuits to the error
//! path after a run of consecutive failures.

use flowpilot_core::config::CircuitBreakerSettings;
use flowpilot_core::step::RetryPolicy;
use log::{debug, warn};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Whether an error qualifies for retry under the policy. An empty
/// pattern list retries everything.
pub fn should_retry(policy: &RetryPolicy, error_text: &str) -> bool {
    if policy.retryable_errors.is_empty() {
        return true;
    }
    let lowered = error_text.to_lowercase();
    policy
        .retryable_errors
        .iter()
        .any(|pattern| lowered.contains(&pattern.to_lowercase()))
}

/// Backoff before the given attempt (1-based over the retries, not the
/// initial call)
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = policy.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    Duration::from_millis((policy.backoff_ms as f64 * factor) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
///
/// Closed until `failure_threshold` consecutive failures; then open for
/// `reset_timeout`, after which a single half-open probe decides whether
/// to close again or re-open.
pub struct CircuitBreaker {
    component: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(component: &str, settings: &CircuitBreakerSettings) -> Self {
        Self {
            component: component.to_string(),
            failure_threshold: settings.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Whether a call may proceed. Transitions open to half-open once the
    /// reset timeout has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit lock");
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    debug!("circuit '{}' half-open after reset timeout", self.component);
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit lock");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit lock");
        match inner.state {
            CircuitState::HalfOpen => {
                warn!("circuit '{}' re-opened by half-open probe failure", self.component);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        "circuit '{}' opened after {} consecutive failures",
                        self.component, inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("circuit lock").state == CircuitState::Open
    }
}
