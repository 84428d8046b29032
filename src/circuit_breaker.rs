//! Circuit breaker guarding calls to the payment provider.
//!
//! After `failure_threshold` consecutive failures the breaker opens and rejects
//! calls without touching the network until `timeout` has elapsed; it then lets
//! trial calls through (half-open) and closes again after `success_threshold`
//! successes.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before transitioning from Open to HalfOpen
    pub timeout: Duration,
    /// Successful trial calls needed in HalfOpen to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

#[derive(Error, Debug, PartialEq)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(&'static str),
    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs `f` unless the circuit is open. Every error returned by `f` counts
    /// as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_execute() {
            metrics::counter!("circuit_breaker_rejections_total", 1, "breaker" => self.name);
            return Err(CircuitBreakerError::CircuitOpen(self.name));
        }

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn can_execute(&self) -> bool {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = state
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= self.config.timeout);
                if cooled_down {
                    tracing::info!(breaker = self.name, "circuit half-open, allowing trial call");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                }
                cooled_down
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen | CircuitState::Open => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(breaker = self.name, "circuit closed");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
        }
    }

    fn on_failure(&self) {
        let mut state = self.lock();
        state.failure_count += 1;

        let should_open = match state.state {
            CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            tracing::warn!(
                breaker = self.name,
                failures = state.failure_count,
                "circuit opened"
            );
            state.state = CircuitState::Open;
            state.success_count = 0;
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }
}
