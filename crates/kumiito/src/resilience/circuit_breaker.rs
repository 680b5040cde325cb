//! Circuit breaker policy.
//!
//! Stops calling a failing service for a while, then lets a bounded number of
//! trial calls through to decide whether it has recovered.

use super::config::CircuitBreakerConfig;
use super::transport::{ClientError, HttpResponse};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CircuitState {
    /// Normal operation; failures are counted.
    #[default]
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// A bounded number of trial calls decide the next state.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    trial_successes: u32,
    trials_in_flight: u32,
    opened_at: Option<Instant>,
}

/// Three-state breaker owned by one resilient client.
///
/// A call counts as a failure if it errored or returned a 5xx status.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                trial_successes: 0,
                trials_in_flight: 0,
                opened_at: None,
            }),
        }
    }

    /// Returns the current state, moving an expired open circuit to half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Runs `call` if the breaker admits it and records the outcome.
    pub async fn call<F, Fut>(&self, call: F) -> Result<HttpResponse, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HttpResponse, ClientError>>,
    {
        let admission = self.acquire()?;
        let mut guard = TrialGuard {
            breaker: self,
            admission,
            settled: false,
        };

        let result = call().await;
        let failed = match &result {
            Ok(response) => response.is_server_error(),
            Err(_) => true,
        };
        guard.settled = true;
        if failed {
            self.on_failure(admission);
        } else {
            self.on_success(admission);
        }
        result
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.open_delay)
            .unwrap_or(true);
        if elapsed {
            info!(circuit = %self.name, "circuit half-open, allowing trial calls");
            inner.state = CircuitState::HalfOpen;
            inner.trial_successes = 0;
            inner.trials_in_flight = 0;
        }
    }

    fn acquire(&self) -> Result<Admission, ClientError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen if inner.trials_in_flight < self.config.half_open_max_calls => {
                inner.trials_in_flight += 1;
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen => Err(self.open_error(&inner)),
            CircuitState::Open => Err(self.open_error(&inner)),
        }
    }

    fn open_error(&self, inner: &BreakerState) -> ClientError {
        let retry_after = inner
            .opened_at
            .map(|at| self.config.open_delay.saturating_sub(at.elapsed()))
            .unwrap_or_default();
        ClientError::CircuitOpen {
            client: self.name.clone(),
            retry_after,
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (inner.state, admission) {
            (CircuitState::Closed, _) => inner.consecutive_failures = 0,
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.success_threshold {
                    info!(circuit = %self.name, "circuit closed");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            // outcome of a call admitted before the last transition
            _ => {}
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (inner.state, admission) {
            (CircuitState::Closed, _) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                    self.open(&mut inner);
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                warn!(circuit = %self.name, "trial call failed, circuit reopened");
                self.open(&mut inner);
            }
            _ => {}
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_successes = 0;
        inner.trials_in_flight = 0;
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }
}

/// Frees a half-open trial slot if the call future is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn breaker(open_delay: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "screens",
            CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                open_delay,
                half_open_max_calls: 1,
            },
        )
    }

    async fn respond(breaker: &CircuitBreaker, status: u16) -> Result<HttpResponse, ClientError> {
        breaker
            .call(|| async move { Ok(HttpResponse::new(status, Vec::new())) })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let breaker = breaker(Duration::from_secs(60));
        for _ in 0..3 {
            let response = respond(&breaker, 500).await.expect("response passes through");
            assert_eq!(response.status, 500);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let attempts = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(HttpResponse::new(200, Vec::new()))
            })
            .await;
        assert!(matches!(result, Err(ClientError::CircuitOpen { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(Duration::from_secs(60));
        respond(&breaker, 503).await.ok();
        respond(&breaker, 503).await.ok();
        respond(&breaker, 200).await.ok();
        respond(&breaker, 503).await.ok();
        respond(&breaker, 503).await.ok();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_successes() {
        let breaker = breaker(Duration::from_millis(20));
        for _ in 0..3 {
            respond(&breaker, 500).await.ok();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        respond(&breaker, 200).await.expect("first trial");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        respond(&breaker, 200).await.expect("second trial");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(Duration::from_millis(20));
        for _ in 0..3 {
            respond(&breaker, 500).await.ok();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = breaker
            .call(|| async { Err(ClientError::Transport("reset".to_string())) })
            .await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_trials() {
        let breaker = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            respond(&breaker, 500).await.ok();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow_trial = breaker.call(|| async move {
            release_rx.await.ok();
            Ok(HttpResponse::new(200, Vec::new()))
        });
        let second = async {
            tokio::task::yield_now().await;
            let rejected = respond(&breaker, 200).await;
            release_tx.send(()).ok();
            rejected
        };
        let (first, second) = tokio::join!(slow_trial, second);

        assert!(first.is_ok());
        assert!(matches!(second, Err(ClientError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_dropped_trial_frees_slot() {
        let breaker = breaker(Duration::from_millis(10));
        for _ in 0..3 {
            respond(&breaker, 500).await.ok();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending = breaker.call(|| std::future::pending::<Result<HttpResponse, ClientError>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(5), pending).await;
        assert!(timed_out.is_err());

        assert!(respond(&breaker, 200).await.is_ok());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }
}
