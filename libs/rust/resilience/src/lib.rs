//! Resilience utilities: bounded retry + circuit breaker.
use std::time::{Duration, Instant};
use thiserror::Error;
use parking_lot::Mutex;
use futures::Future;
use tracing::{warn, debug};
use opentelemetry::{global, metrics::Counter, KeyValue};
use once_cell::sync::Lazy;

static RETRY_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("gateway-resilience")
        .u64_counter("gateway_resilience_retry_attempts_total")
        .with_description("Total retry attempts executed")
        .build()
});

static CIRCUIT_OPEN: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("gateway-resilience")
        .u64_counter("gateway_resilience_circuit_open_total")
        .with_description("Number of times a circuit transitioned to open")
        .build()
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("circuit open for {0}")]
    CircuitOpen(String),
}

/// Runs `f` up to `attempts` times, sleeping `delay` between tries.
pub async fn retry_async<F, Fut, T, E>(f: F, attempts: usize, delay: Duration) -> Result<T, E>
where F: FnMut() -> Fut, Fut: Future<Output = Result<T, E>> {
    retry_async_if(f, attempts, delay, |_| true).await
}

/// Like [`retry_async`] but only errors accepted by `retryable` are retried; any other
/// error is returned immediately.
pub async fn retry_async_if<F, Fut, T, E, P>(mut f: F, attempts: usize, delay: Duration, retryable: P) -> Result<T, E>
where F: FnMut() -> Fut, Fut: Future<Output = Result<T, E>>, P: Fn(&E) -> bool {
    let attempts = attempts.max(1);
    let mut i = 0;
    loop {
        RETRY_ATTEMPTS.add(1, &[]);
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if i + 1 >= attempts || !retryable(&e) => return Err(e),
            Err(_) => { debug!(attempt = i + 1, "retrying after failure"); tokio::time::sleep(delay).await; }
        }
        i += 1;
    }
}

pub struct CircuitBreaker {
    name: String,
    state: Mutex<State>,
    half_open_after: Duration,
    failure_threshold: u32,
}

struct State { failures: u32, opened_at: Option<Instant> }

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, half_open_after: Duration) -> Self {
        Self { name: name.into(), state: Mutex::new(State { failures:0, opened_at: None }), half_open_after, failure_threshold: failure_threshold.max(1) }
    }
    pub fn name(&self) -> &str { &self.name }
    pub fn allow(&self) -> bool {
        let mut st = self.state.lock();
        if let Some(opened) = st.opened_at { if opened.elapsed() >= self.half_open_after { debug!(breaker=%self.name, "half-open trial"); st.opened_at=None; st.failures=self.failure_threshold - 1; return true; } else { return false; } }
        true
    }
    /// Returns `Err(CircuitOpen)` instead of a bare bool, for use with `?`.
    pub fn check(&self) -> Result<(), ResilienceError> {
        if self.allow() { Ok(()) } else { Err(ResilienceError::CircuitOpen(self.name.clone())) }
    }
    pub fn is_open(&self) -> bool { self.state.lock().opened_at.is_some() }
    pub fn record_success(&self) { let mut st = self.state.lock(); st.failures=0; st.opened_at=None; }
    pub fn record_failure(&self) {
        let mut st = self.state.lock();
        st.failures += 1;
        if st.failures >= self.failure_threshold && st.opened_at.is_none() {
            st.opened_at = Some(Instant::now());
            CIRCUIT_OPEN.add(1, &[KeyValue::new("breaker", self.name.clone())]);
            warn!(breaker=%self.name, failures=st.failures, "circuit opened");
        }
    }
}
