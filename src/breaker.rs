//! Circuit breaker wrapped around calls to the identity source.
//!
//! The breaker bounds concurrency with a semaphore, applies a per-call timeout, and opens after
//! a run of consecutive failures. While open, calls fail fast until the cool-down elapses; then a
//! single probe is let through (half-open) and its outcome decides whether the circuit closes.
//! A probe that is dropped before it finishes hands its slot back to the next caller.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{config_error, IdpResult};

/// Tunables for [`CircuitBreaker`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerPolicy {
    pub max_concurrent: usize,
    pub timeout_ms: u64,
    pub failure_threshold: u32,
    pub open_secs: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            timeout_ms: 1_000,
            failure_threshold: 5,
            open_secs: 5,
        }
    }
}

impl BreakerPolicy {
    pub fn validate(&self) -> IdpResult<()> {
        if self.max_concurrent == 0 {
            return Err(config_error("breaker.maxConcurrent must be positive"));
        }
        if self.timeout_ms == 0 {
            return Err(config_error("breaker.timeoutMs must be positive"));
        }
        if self.failure_threshold == 0 {
            return Err(config_error("breaker.failureThreshold must be positive"));
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_secs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit is open")]
    Open,
    #[error("too many concurrent calls")]
    Saturated,
    #[error("call timed out")]
    Timeout,
    #[error(transparent)]
    Inner(E),
}

struct BreakerState {
    circuit: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: &'static str,
    policy: BreakerPolicy,
    permits: Semaphore,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, policy: BreakerPolicy) -> Self {
        let permits = Semaphore::new(policy.max_concurrent);
        Self {
            name,
            policy,
            permits,
            state: Mutex::new(BreakerState {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit
    }

    /// Runs `call` under the breaker. Only `Err` results and timeouts count as failures.
    pub async fn call<F, Fut, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut probe = ProbeSlot {
            breaker: self,
            held: self.admit::<E>()?,
        };
        let Ok(_permit) = self.permits.try_acquire() else {
            return Err(BreakerError::Saturated);
        };

        let outcome = tokio::time::timeout(self.policy.timeout(), call()).await;
        probe.held = false;
        match outcome {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.on_failure();
                Err(BreakerError::Timeout)
            }
        }
    }

    /// Returns whether this call is the half-open probe.
    fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let cooled = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.policy.open_duration());
                if !cooled {
                    return Err(BreakerError::Open);
                }
                debug!(breaker = self.name, "circuit half-open, probing");
                state.circuit = CircuitState::HalfOpen;
                state.probe_in_flight = true;
                Ok(true)
            }
            CircuitState::HalfOpen if state.probe_in_flight => Err(BreakerError::Open),
            CircuitState::HalfOpen => {
                state.probe_in_flight = true;
                Ok(true)
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if state.circuit != CircuitState::Closed {
            debug!(breaker = self.name, "circuit closed");
        }
        state.circuit = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.probe_in_flight = false;
        let trip = state.circuit == CircuitState::HalfOpen
            || state.consecutive_failures >= self.policy.failure_threshold;
        if trip && state.circuit != CircuitState::Open {
            warn!(
                breaker = self.name,
                failures = state.consecutive_failures,
                "circuit opened"
            );
            state.circuit = CircuitState::Open;
            state.opened_at = Some(Instant::now());
        }
    }
}

/// Hands the half-open probe slot back if the probing call never reports an outcome,
/// e.g. when its future is dropped mid-flight.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let mut state = self.breaker.state.lock();
        if state.circuit == CircuitState::HalfOpen {
            debug!(breaker = self.breaker.name, "probe abandoned, releasing slot");
            state.probe_in_flight = false;
        }
    }
}
