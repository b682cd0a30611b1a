use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::EngineError;

/// Breaker state machine: CLOSED passes calls through, OPEN short-circuits
/// them, HALF_OPEN lets probes through after the recovery timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// State transition worth surfacing as an observability event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened { consecutive_failures: u32 },
    Closed,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker keyed per logical dependency (one per exchange
/// connection), shared across every monitor that uses that dependency.
///
/// All state mutation happens under one mutex, so concurrent callers
/// serialize on transitions (single-writer invariant).
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admission check before attempting the underlying operation. While
    /// OPEN, flips to HALF_OPEN once `recovery_timeout` has elapsed since the
    /// last failure and lets the call through as a probe.
    pub fn try_acquire(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    tracing::info!(breaker = %self.name, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(EngineError::BreakerOpen(self.name.clone()))
                }
            }
        }
    }

    /// Record one successful call. Returns `Closed` when a HALF_OPEN probe
    /// streak reaches the success threshold.
    pub fn record_success(&self) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    Some(BreakerTransition::Closed)
                } else {
                    None
                }
            }
            // A success while OPEN means a caller raced a transition; count
            // nothing, the next try_acquire decides.
            BreakerState::Open => None,
        }
    }

    /// Record one failed call (one per exhausted retry sequence, not one per
    /// attempt). Returns `Opened` on the CLOSED->OPEN or HALF_OPEN->OPEN
    /// transition.
    pub fn record_failure(&self) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    Some(BreakerTransition::Opened {
                        consecutive_failures: inner.consecutive_failures,
                    })
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                // Any single failure while probing re-opens.
                inner.state = BreakerState::Open;
                inner.consecutive_failures += 1;
                inner.consecutive_successes = 0;
                Some(BreakerTransition::Opened {
                    consecutive_failures: inner.consecutive_failures,
                })
            }
            BreakerState::Open => None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }
}
