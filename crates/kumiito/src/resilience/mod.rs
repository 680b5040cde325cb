//! Resilience pipeline for outbound calls.
//!
//! Every call made through a [`ResilientClient`] passes through four policies
//! in a fixed order, outermost first:
//!
//! 1. **Fallback** - replaces a final error or 5xx with a synthetic response
//! 2. **Retry** - re-runs errored or retryable-status attempts with backoff
//! 3. **Circuit breaker** - rejects calls while the service is failing
//! 4. **Timeout** - bounds each attempt
//!
//! Retrying outside the breaker means every retry is still subject to it.

mod circuit_breaker;
mod config;
mod retry;
mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::{
    CircuitBreakerConfig, ConfigError, FallbackConfig, ResilienceConfig, ResilienceConfigBuilder,
    RetryConfig, TimeoutConfig,
};
pub use retry::backoff;
pub use transport::{ClientError, HttpRequest, HttpResponse, ReqwestTransport, Transport};

use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// An HTTP client wrapped in the resilience policies.
///
/// Cheap to share behind an `Arc`; the breaker state is the only mutable part.
pub struct ResilientClient {
    name: String,
    config: Arc<ResilienceConfig>,
    breaker: CircuitBreaker,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("circuit", &self.breaker.state())
            .finish()
    }
}

impl ResilientClient {
    /// Creates a client sending through `reqwest`.
    ///
    /// Fails with [`ClientError::Config`] when `config` does not validate,
    /// which matters for configurations deserialized or edited field by field.
    pub fn new(name: impl Into<String>, config: ResilienceConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let transport = ReqwestTransport::new(&config.timeouts)?;
        Self::with_transport(name, config, Arc::new(transport))
    }

    /// Creates a client sending through a custom transport.
    pub fn with_transport(
        name: impl Into<String>,
        config: ResilienceConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let name = name.into();
        let breaker = CircuitBreaker::new(name.clone(), config.circuit_breaker.clone());
        Ok(Self {
            name,
            config: Arc::new(config),
            breaker,
            transport,
        })
    }

    /// Returns the client name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the policy configuration.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Returns the breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Sends `request` through fallback, retry, circuit breaker and timeout.
    pub async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, ClientError> {
        let result = retry::run(&self.config.retry, &self.name, || {
            self.breaker.call(|| self.attempt(request))
        })
        .await;
        self.fallback(result)
    }

    async fn attempt(&self, request: &HttpRequest) -> Result<HttpResponse, ClientError> {
        let timeout = request.timeout.unwrap_or(self.config.timeouts.request);
        debug!(client = %self.name, method = %request.method, url = %request.url, "sending request");
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout { timeout }),
        }
    }

    fn fallback(
        &self,
        result: Result<HttpResponse, ClientError>,
    ) -> Result<HttpResponse, ClientError> {
        let fallback = &self.config.fallback;
        let failed = match &result {
            Ok(response) => response.is_server_error(),
            Err(ClientError::Cancelled) => false,
            Err(_) => true,
        };
        if !fallback.enabled || !failed {
            return result;
        }

        match &result {
            Ok(response) => warn!(client = %self.name, status = response.status, "serving fallback response"),
            Err(e) => warn!(client = %self.name, error = %e, "serving fallback response"),
        }
        Ok(HttpResponse {
            status: fallback.status,
            headers: fallback.headers.clone(),
            body: fallback.body.clone().into_bytes(),
            is_fallback: true,
        })
    }
}
