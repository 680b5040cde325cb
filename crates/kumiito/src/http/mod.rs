//! HTTP step: a templated outbound call whose shaped result lands in the
//! execution context.

pub mod template;

use crate::resilience::{ClientError, HttpRequest, HttpResponse, ResilientClient};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kumiito_core::{ExecutionContext, FlowError, Map, Step, StepName, Transformer, Validator};
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Context key holding request/response metadata of the last HTTP step.
pub const HTTP_METADATA_KEY: &str = "http_metadata";

/// Context key used when no result key is configured.
pub const DEFAULT_RESULT_KEY: &str = "http_response";

/// Statuses accepted when none are configured.
pub const DEFAULT_EXPECTED_STATUS: [u16; 4] = [200, 201, 202, 204];

/// Key wrapping bodies that are not a JSON object.
pub const RAW_RESPONSE_KEY: &str = "raw_response";

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// JSON object; string values are interpolated.
    Json(Map),
    /// JSON text interpolated as a whole, then parsed.
    JsonTemplate(String),
    /// URL-encoded form; values are interpolated.
    Form(BTreeMap<String, String>),
    /// Bytes sent as is.
    Raw {
        /// Payload.
        bytes: Vec<u8>,
        /// Value of the `content-type` header.
        content_type: String,
    },
}

/// Request authentication; credentials are templates.
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    /// `Authorization: Basic ...`
    Basic {
        /// User name template.
        username: String,
        /// Password template.
        password: String,
    },
    /// `Authorization: Bearer ...`
    Bearer(String),
}

/// A step that calls an HTTP endpoint through a [`ResilientClient`].
///
/// URL, headers, query values, credentials and body strings may contain
/// `${key}` or `${a.b.c}` placeholders resolved against the context; a
/// placeholder with no value is sent literally.
///
/// # Examples
///
/// ```no_run
/// use kumiito::http::HttpStep;
/// use kumiito::resilience::{ResilienceConfig, ResilientClient};
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Arc::new(ResilientClient::new("screens", ResilienceConfig::default())?);
/// let step = HttpStep::builder("fetch_screen", client)
///     .get("https://screens.internal/api/screens/${screen_id}")
///     .query("user_id", "${user_id}")
///     .bearer_token("${auth.token}")
///     .result_key("screen")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct HttpStep {
    name: StepName,
    client: Arc<ResilientClient>,
    method: Method,
    url: String,
    headers: BTreeMap<String, String>,
    query: Vec<(String, String)>,
    body: Option<Body>,
    auth: Option<Auth>,
    expected_status: BTreeSet<u16>,
    result_key: String,
    transformer: Option<Arc<dyn Transformer>>,
    validator: Option<Arc<dyn Validator>>,
    timeout: Option<Duration>,
}

impl fmt::Debug for HttpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStep")
            .field("name", &self.name)
            .field("client", &self.client.name())
            .field("method", &self.method)
            .field("url", &self.url)
            .field("result_key", &self.result_key)
            .field("expected_status", &self.expected_status)
            .finish()
    }
}

impl HttpStep {
    /// Starts a builder for a step calling through `client`.
    pub fn builder(name: impl Into<StepName>, client: Arc<ResilientClient>) -> HttpStepBuilder {
        HttpStepBuilder::new(name.into(), client)
    }

    /// Resolves the request this step would send against `ctx`.
    pub fn build_request(&self, ctx: &ExecutionContext) -> Result<HttpRequest, FlowError> {
        let raw_url = template::interpolate_url(&self.url, ctx);
        let mut url = url::Url::parse(&raw_url)
            .map_err(|e| self.template_error(format!("invalid URL '{raw_url}': {e}")))?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &self.query {
                pairs.append_pair(name, &template::interpolate(value, ctx));
            }
        }

        let mut request = HttpRequest::new(self.method.clone(), String::from(url));
        request.timeout = self.timeout;
        for (name, value) in &self.headers {
            request
                .headers
                .insert(name.clone(), template::interpolate(value, ctx));
        }

        if let Some(auth) = &self.auth {
            let value = match auth {
                Auth::Basic { username, password } => {
                    let credentials = format!(
                        "{}:{}",
                        template::interpolate(username, ctx),
                        template::interpolate(password, ctx)
                    );
                    format!("Basic {}", STANDARD.encode(credentials))
                }
                Auth::Bearer(token) => format!("Bearer {}", template::interpolate(token, ctx)),
            };
            request.headers.insert("authorization".to_string(), value);
        }

        if let Some(body) = &self.body {
            let (bytes, content_type) = self.encode_body(body, ctx)?;
            let has_content_type = request
                .headers
                .keys()
                .any(|name| name.eq_ignore_ascii_case("content-type"));
            if !has_content_type {
                request
                    .headers
                    .insert("content-type".to_string(), content_type);
            }
            request.body = Some(bytes);
        }

        Ok(request)
    }

    fn encode_body(
        &self,
        body: &Body,
        ctx: &ExecutionContext,
    ) -> Result<(Vec<u8>, String), FlowError> {
        match body {
            Body::Json(map) => {
                let value = Value::Object(template::interpolate_map(map, ctx));
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| self.template_error(format!("cannot encode JSON body: {e}")))?;
                Ok((bytes, "application/json".to_string()))
            }
            Body::JsonTemplate(text) => {
                let rendered = template::interpolate(text, ctx);
                let value: Value = serde_json::from_str(&rendered).map_err(|e| {
                    self.template_error(format!("JSON body template is not valid JSON: {e}"))
                })?;
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| self.template_error(format!("cannot encode JSON body: {e}")))?;
                Ok((bytes, "application/json".to_string()))
            }
            Body::Form(fields) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(
                        fields
                            .iter()
                            .map(|(k, v)| (k.as_str(), template::interpolate(v, ctx))),
                    )
                    .finish();
                Ok((
                    encoded.into_bytes(),
                    "application/x-www-form-urlencoded".to_string(),
                ))
            }
            Body::Raw {
                bytes,
                content_type,
            } => Ok((bytes.clone(), content_type.clone())),
        }
    }

    fn template_error(&self, details: String) -> FlowError {
        FlowError::Template {
            step_name: self.name.clone(),
            details,
        }
    }

    fn interrupted(&self, ctx: &ExecutionContext) -> FlowError {
        if ctx.is_timed_out() {
            FlowError::Timeout {
                step_name: self.name.clone(),
            }
        } else {
            FlowError::Cancelled {
                step_name: self.name.clone(),
            }
        }
    }

    fn metadata(request: &HttpRequest, response: &HttpResponse, duration: Duration) -> Value {
        json!({
            "status_code": response.status,
            "headers": response.headers,
            "content_length": response.body.len(),
            "duration_ms": duration.as_millis() as u64,
            "method": request.method.as_str(),
            "url": request.url,
            "fallback": response.is_fallback,
        })
    }
}

/// Parses a response body into a JSON object.
///
/// Anything that is not a JSON object, an empty body included, is wrapped as
/// `{"raw_response": <text>}`.
pub fn parse_body(response: &HttpResponse) -> Map {
    match serde_json::from_slice::<Value>(&response.body) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert(RAW_RESPONSE_KEY.to_string(), Value::String(response.text()));
            map
        }
    }
}

#[async_trait]
impl Step for HttpStep {
    async fn run(&self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if ctx.is_done() {
            return Err(self.interrupted(ctx));
        }
        let request = self.build_request(ctx)?;
        debug!(step = %self.name, method = %request.method, url = %request.url, "calling service");

        let started = Instant::now();
        let result = tokio::select! {
            result = self.client.execute(&request) => result,
            _ = ctx.cancelled() => Err(ClientError::Cancelled),
        };
        let duration = started.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(ClientError::Cancelled) => return Err(self.interrupted(ctx)),
            Err(e) => {
                warn!(step = %self.name, error = %e, "service call failed");
                return Err(FlowError::Transport {
                    step_name: self.name.clone(),
                    source: Box::new(e),
                });
            }
        };

        ctx.metrics()
            .record_http(request.method.as_str(), &request.url, response.status, duration);
        ctx.set(HTTP_METADATA_KEY, Self::metadata(&request, &response, duration));

        if !self.expected_status.contains(&response.status) {
            return Err(FlowError::UnexpectedStatus {
                step_name: self.name.clone(),
                status: response.status,
                expected: self.expected_status.iter().copied().collect(),
            });
        }

        let mut data = parse_body(&response);

        if let Some(transformer) = &self.transformer {
            let started = Instant::now();
            let result = transformer.transform(&data).await;
            ctx.metrics()
                .record_transform(transformer.name(), started.elapsed(), result.is_ok());
            data = result?;
        }

        if let Some(validator) = &self.validator {
            let result = validator.validate(&data);
            ctx.metrics()
                .record_validation(validator.name(), result.is_ok());
            result?;
        }

        ctx.set(self.result_key.clone(), Value::Object(data));
        Ok(())
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}

/// Builder for [`HttpStep`].
pub struct HttpStepBuilder {
    step: HttpStep,
}

impl HttpStepBuilder {
    fn new(name: StepName, client: Arc<ResilientClient>) -> Self {
        Self {
            step: HttpStep {
                name,
                client,
                method: Method::GET,
                url: String::new(),
                headers: BTreeMap::new(),
                query: Vec::new(),
                body: None,
                auth: None,
                expected_status: DEFAULT_EXPECTED_STATUS.into_iter().collect(),
                result_key: DEFAULT_RESULT_KEY.to_string(),
                transformer: None,
                validator: None,
                timeout: None,
            },
        }
    }

    /// Sets method and URL template.
    pub fn request(mut self, method: Method, url: impl Into<String>) -> Self {
        self.step.method = method;
        self.step.url = url.into();
        self
    }

    /// `GET url`
    pub fn get(self, url: impl Into<String>) -> Self {
        self.request(Method::GET, url)
    }

    /// `POST url`
    pub fn post(self, url: impl Into<String>) -> Self {
        self.request(Method::POST, url)
    }

    /// `PUT url`
    pub fn put(self, url: impl Into<String>) -> Self {
        self.request(Method::PUT, url)
    }

    /// `PATCH url`
    pub fn patch(self, url: impl Into<String>) -> Self {
        self.request(Method::PATCH, url)
    }

    /// `DELETE url`
    pub fn delete(self, url: impl Into<String>) -> Self {
        self.request(Method::DELETE, url)
    }

    /// Adds a header template.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.step.headers.insert(name.into(), value.into());
        self
    }

    /// Adds a query parameter template.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.step.query.push((name.into(), value.into()));
        self
    }

    /// Sets a JSON object body.
    pub fn json_body(mut self, body: Map) -> Self {
        self.step.body = Some(Body::Json(body));
        self
    }

    /// Sets a JSON text template body.
    pub fn json_template(mut self, template: impl Into<String>) -> Self {
        self.step.body = Some(Body::JsonTemplate(template.into()));
        self
    }

    /// Sets a URL-encoded form body.
    pub fn form_body<I, K, V>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.step.body = Some(Body::Form(fields));
        self
    }

    /// Sets a raw body.
    pub fn raw_body(mut self, bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        self.step.body = Some(Body::Raw {
            bytes: bytes.into(),
            content_type: content_type.into(),
        });
        self
    }

    /// Uses basic authentication.
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.step.auth = Some(Auth::Basic {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Uses a bearer token.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.step.auth = Some(Auth::Bearer(token.into()));
        self
    }

    /// Replaces the accepted statuses.
    pub fn expect_status(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.step.expected_status = statuses.into_iter().collect();
        self
    }

    /// Sets the context key the result is stored under.
    pub fn result_key(mut self, key: impl Into<String>) -> Self {
        self.step.result_key = key.into();
        self
    }

    /// Shapes the parsed response before it is stored.
    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.step.transformer = Some(transformer);
        self
    }

    /// Checks the shaped response before it is stored.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.step.validator = Some(validator);
        self
    }

    /// Overrides the client's request timeout for this step.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.step.timeout = Some(timeout);
        self
    }

    /// Builds the step.
    pub fn build(self) -> Result<HttpStep, FlowError> {
        if self.step.url.trim().is_empty() {
            return Err(FlowError::Configuration(format!(
                "HTTP step '{}' has no URL",
                self.step.name
            )));
        }
        if self.step.expected_status.is_empty() {
            return Err(FlowError::Configuration(format!(
                "HTTP step '{}' accepts no status",
                self.step.name
            )));
        }
        Ok(self.step)
    }
}
