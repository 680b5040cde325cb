//! The single "perform request" primitive the policies wrap.

use super::config::{ConfigError, TimeoutConfig};
use async_trait::async_trait;
use reqwest::Method;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the resilient client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientError {
    /// An attempt exceeded its request timeout.
    #[error("Request timed out after {timeout:?}")]
    Timeout {
        /// The timeout that expired.
        timeout: Duration,
    },

    /// The circuit is open and the call was not attempted.
    #[error("Circuit '{client}' is open, retry after {retry_after:?}")]
    CircuitOpen {
        /// The client owning the breaker.
        client: String,
        /// Time until half-open trials are allowed.
        retry_after: Duration,
    },

    /// Connecting, sending or reading failed.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The caller's context was cancelled while the call was in flight.
    #[error("Request cancelled")]
    Cancelled,

    /// The underlying client could not be constructed.
    #[error("Client setup failed: {0}")]
    Setup(String),

    /// The policy configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A fully resolved outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Encoded body, if any.
    pub body: Option<Vec<u8>>,
    /// Per-attempt timeout overriding the client's request timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
        }
    }
}

/// A response as seen by the caller of the resilient client.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers, lower-cased names.
    pub headers: BTreeMap<String, String>,
    /// Raw body.
    pub body: Vec<u8>,
    /// `true` when the fallback policy substituted this response.
    pub is_fallback: bool,
}

impl HttpResponse {
    /// Creates a response with an empty header set.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
            is_fallback: false,
        }
    }

    /// Returns `true` for 5xx statuses.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    /// Returns the body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the request; non-2xx statuses are responses, not errors.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ClientError>;
}

/// [`Transport`] backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a client with the connect and keep-alive settings of `timeouts`.
    ///
    /// The request timeout is enforced by the timeout policy, not here.
    pub fn new(timeouts: &TimeoutConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .pool_idle_timeout(timeouts.keep_alive)
            .tcp_keepalive(timeouts.keep_alive)
            .build()
            .map_err(|e| ClientError::Setup(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn map_error(error: reqwest::Error) -> ClientError {
        if error.is_connect() {
            ClientError::Transport(format!("Connection error: {error}"))
        } else {
            ClientError::Transport(format!("HTTP error: {error}"))
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ClientError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(Self::map_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(Self::map_error)?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
            is_fallback: false,
        })
    }
}
