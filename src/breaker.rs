//! Circuit breaker.
//!
//! CLOSED allows calls through. After `failure_threshold` consecutive
//! failures it trips OPEN and rejects calls with `Error::CircuitOpen`
//! without attempting them. Once `reset_timeout` has elapsed since
//! `opened_at`, the next call is allowed through in HALF_OPEN. A single
//! success in HALF_OPEN closes the breaker (and resets the failure count);
//! a single failure re-arms OPEN. `half_open_max_calls` bounds how many
//! trial calls are admitted while HALF_OPEN is deciding — it does not
//! change how many successes are required to close.
//! Cancellations never count as failures — `call()` checks
//! `Error::is_cancellation()` and skips both `on_success`/`on_failure`
//! when a call was cancelled rather than actually failing.
//!
//! Every state transition is reported to an [`AgentMetrics`] sink via
//! `record_breaker_transition`, spec.md §7's observability requirement.

use crate::capabilities::AgentMetrics;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl From<CircuitState> for u8 {
    fn from(s: CircuitState) -> Self {
        match s {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl CircuitState {
    fn label(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// A single breaker guarding one upstream dependency (e.g. one model
/// endpoint). Safe to share via `Arc` across concurrent callers.
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU32,
    half_open_call_count: AtomicU32,
    opened_at_millis: AtomicI64,
    epoch: Instant,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    metrics: Arc<dyn AgentMetrics>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration, half_open_max_calls: u32, metrics: Arc<dyn AgentMetrics>) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.into()),
            failure_count: AtomicU32::new(0),
            half_open_call_count: AtomicU32::new(0),
            opened_at_millis: AtomicI64::new(0),
            epoch: Instant::now(),
            failure_threshold,
            reset_timeout,
            half_open_max_calls,
            metrics,
        }
    }

    fn now_millis(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Gate a call: returns `Ok(())` if the call may proceed (transitioning
    /// OPEN→HALF_OPEN when the reset timeout has elapsed), or
    /// `Err(Error::CircuitOpen)` if it must be rejected outright.
    pub fn try_acquire(&self) -> Result<()> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if self.half_open_call_count.fetch_add(1, Ordering::SeqCst) < self.half_open_max_calls {
                    Ok(())
                } else {
                    Err(Error::CircuitOpen)
                }
            }
            CircuitState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::SeqCst);
                if self.now_millis() - opened_at >= self.reset_timeout.as_millis() as i64 {
                    self.transition_to_half_open();
                    Ok(())
                } else {
                    Err(Error::CircuitOpen)
                }
            }
        }
    }

    fn transition_to_half_open(&self) {
        self.half_open_call_count.store(1, Ordering::SeqCst);
        self.state.store(CircuitState::HalfOpen.into(), Ordering::SeqCst);
        self.metrics.record_breaker_transition(CircuitState::Open.label(), CircuitState::HalfOpen.label());
    }

    fn trip_open(&self, from: CircuitState) {
        self.opened_at_millis.store(self.now_millis(), Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.half_open_call_count.store(0, Ordering::SeqCst);
        self.state.store(CircuitState::Open.into(), Ordering::SeqCst);
        self.metrics.record_breaker_transition(from.label(), CircuitState::Open.label());
    }

    /// Report a successful call.
    pub fn on_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                self.state.store(CircuitState::Closed.into(), Ordering::SeqCst);
                self.failure_count.store(0, Ordering::SeqCst);
                self.half_open_call_count.store(0, Ordering::SeqCst);
                self.metrics.record_breaker_transition(CircuitState::HalfOpen.label(), CircuitState::Closed.label());
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    /// Report a failed call. Never call this for cancellations.
    pub fn on_failure(&self) {
        match self.state() {
            CircuitState::HalfOpen => self.trip_open(CircuitState::HalfOpen),
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    self.trip_open(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker: acquire, execute, record outcome.
    /// Cancellation errors are reported to neither success nor failure
    /// counters.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }
}
