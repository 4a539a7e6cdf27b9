//! Failure handling: retry decisions, circuit breakers and compensation.
//!
//! Errors are classified as transient (retried with exponential backoff and
//! jitter), permanent (fail immediately) or needing compensation (run the
//! step's compensating action, then fail). A circuit breaker per agent
//! instance stops calling an instance after repeated transient failures and
//! lets a limited number of probes through once the cooldown elapses.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{ErrorClass, RetryPolicy};

/// Circuit breaker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within the window that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Rolling window for counting failures, in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Time the circuit stays open before probing, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Concurrent probe requests allowed while half-open
    #[serde(default = "default_half_open_probes")]
    pub half_open_max_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_half_open_probes() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_ms: default_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            half_open_max_probes: default_half_open_probes(),
        }
    }
}

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,

    /// Requests are rejected without contacting the agent
    Open,

    /// Cooldown elapsed, probing for recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// Circuit breaker for a single agent instance
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.refresh(&mut inner);
        inner
    }

    /// Move from open to half-open once the cooldown has elapsed
    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .map(|t| t.elapsed() >= Duration::from_millis(self.config.cooldown_ms))
            .unwrap_or(true);
        if cooled {
            info!(breaker = %self.key, "Circuit breaker half-open, probing");
            inner.state = CircuitState::HalfOpen;
            inner.probes_in_flight = 0;
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask to send a request. Consumes a probe slot when half-open.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record that the agent answered
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen => {
                info!(breaker = %self.key, "Circuit breaker closing after successful probe");
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.probes_in_flight = 0;
            }
            // Late result from a request admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// Record a transient failure or timeout
    pub fn record_failure(&self) {
        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }

                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.key,
                        failures = inner.failures.len(),
                        "Circuit breaker opening due to failures"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.key, "Circuit breaker re-opening after failed probe");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probes_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// Breakers keyed by agent instance
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a key
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    /// Current state of every breaker, sorted by key
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(k, b)| (k.clone(), b.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again
    Retry { delay: Duration },

    /// Give up
    Fail,

    /// Run the compensating action, then give up
    Compensate,
}

/// Retry policy evaluation and breaker bookkeeping
#[derive(Debug, Default)]
pub struct ErrorHandler {
    breakers: CircuitRegistry,
}

impl ErrorHandler {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: CircuitRegistry::new(config),
        }
    }

    pub fn breakers(&self) -> &CircuitRegistry {
        &self.breakers
    }

    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers.breaker(key)
    }

    /// Decide how to proceed after attempt `attempt` (1-indexed) failed
    pub fn decide(&self, class: ErrorClass, attempt: u32, policy: &RetryPolicy) -> RetryDecision {
        match class {
            ErrorClass::Transient if policy.should_retry(attempt) => RetryDecision::Retry {
                delay: self.backoff(policy, attempt),
            },
            ErrorClass::Transient | ErrorClass::Permanent => RetryDecision::Fail,
            ErrorClass::NeedsCompensation => RetryDecision::Compensate,
        }
    }

    /// Exponential backoff for an attempt, with jitter applied
    pub fn backoff(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        apply_jitter(policy.delay_for_attempt(attempt), policy.jitter_factor)
    }
}

/// Spread a delay by up to `factor / 2` in either direction
pub fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    let factor = factor.clamp(0.0, 1.0);
    if factor == 0.0 || delay.is_zero() {
        return delay;
    }

    let mut rng = rand::rng();
    let jitter_range = delay.as_secs_f64() * factor;
    let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
    Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
}
