//! Resilience policy configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;

/// Error returned when a [`ResilienceConfig`] is invalid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid resilience configuration: {0}")]
pub struct ConfigError(pub &'static str);

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Connection and request timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to establish a connection.
    #[serde(with = "duration_ms")]
    pub connect: Duration,
    /// Time allowed for one request attempt.
    #[serde(with = "duration_ms")]
    pub request: Duration,
    /// Idle time before a pooled connection is dropped.
    #[serde(with = "duration_ms")]
    pub keep_alive: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            request: Duration::from_secs(30),
            keep_alive: Duration::from_secs(90),
        }
    }
}

/// Retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
    /// Randomize delays to spread out concurrent callers.
    pub jitter: bool,
    /// Response statuses that are retried.
    pub retryable_status: BTreeSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            retryable_status: [408, 429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-indexed), before jitter.
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Returns `true` if `status` should be retried.
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_status.contains(&status)
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Successful half-open trials that close the circuit.
    pub success_threshold: u32,
    /// Time the circuit stays open before allowing trials.
    #[serde(with = "duration_ms")]
    pub open_delay: Duration,
    /// Trial calls allowed in flight while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_delay: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Synthetic response served when the call ultimately fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Whether failures are replaced by the synthetic response.
    pub enabled: bool,
    /// Status of the synthetic response.
    pub status: u16,
    /// Body of the synthetic response.
    pub body: String,
    /// Headers of the synthetic response.
    pub headers: BTreeMap<String, String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            status: 200,
            body: "{}".to_string(),
            headers: [("content-type".to_string(), "application/json".to_string())]
                .into_iter()
                .collect(),
        }
    }
}

/// Policy configuration of one resilient client.
///
/// Built once through [`ResilienceConfig::builder`] and shared read-only
/// between concurrent calls.
///
/// # Examples
///
/// ```
/// use kumiito::resilience::ResilienceConfig;
/// use std::time::Duration;
///
/// let config = ResilienceConfig::builder()
///     .max_retries(2)
///     .backoff(Duration::from_millis(50), Duration::from_secs(1))
///     .failure_threshold(3)
///     .fallback(200, r#"{"screens":[]}"#)
///     .build()?;
///
/// assert_eq!(config.retry.max_retries, 2);
/// assert!(config.fallback.enabled);
/// # Ok::<(), kumiito::resilience::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Timeouts.
    pub timeouts: TimeoutConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Circuit breaker policy.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Fallback policy.
    pub fallback: FallbackConfig,
}

impl ResilienceConfig {
    /// Starts a builder from the defaults.
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::default()
    }

    /// Checks the invariants the policies rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeouts.request.is_zero() {
            return Err(ConfigError("request timeout must be greater than 0"));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(ConfigError("multiplier must be at least 1.0"));
        }
        if self.retry.multiplier > 10.0 {
            return Err(ConfigError(
                "multiplier must be 10 or less to avoid overflow",
            ));
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return Err(ConfigError("max_delay must be >= initial_delay"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError("failure_threshold must be greater than 0"));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigError("success_threshold must be greater than 0"));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(ConfigError("half_open_max_calls must be greater than 0"));
        }
        if !(100..=599).contains(&self.fallback.status) {
            return Err(ConfigError("fallback status must be a valid HTTP status"));
        }
        Ok(())
    }
}

/// Fluent builder for [`ResilienceConfig`].
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.connect = timeout;
        self
    }

    /// Sets the per-attempt request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.request = timeout;
        self
    }

    /// Sets the keep-alive duration of pooled connections.
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.timeouts.keep_alive = duration;
        self
    }

    /// Sets the number of retries after the first attempt.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    /// Sets the backoff bounds.
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.retry.initial_delay = initial;
        self.config.retry.max_delay = max;
        self
    }

    /// Sets the backoff multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry.multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    /// Replaces the set of retryable statuses.
    pub fn retryable_status(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.config.retry.retryable_status = statuses.into_iter().collect();
        self
    }

    /// Sets the consecutive failures that open the circuit.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    /// Sets the half-open successes that close the circuit.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.success_threshold = threshold;
        self
    }

    /// Sets how long the circuit stays open.
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.config.circuit_breaker.open_delay = delay;
        self
    }

    /// Sets the number of concurrent half-open trials.
    pub fn half_open_max_calls(mut self, calls: u32) -> Self {
        self.config.circuit_breaker.half_open_max_calls = calls;
        self
    }

    /// Enables the fallback with the given status and body.
    pub fn fallback(mut self, status: u16, body: impl Into<String>) -> Self {
        self.config.fallback.enabled = true;
        self.config.fallback.status = status;
        self.config.fallback.body = body.into();
        self
    }

    /// Adds a header to the fallback response.
    pub fn fallback_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.fallback.headers.insert(name.into(), value.into());
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<ResilienceConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
