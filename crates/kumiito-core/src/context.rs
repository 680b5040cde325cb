//! Execution context: the working memory of one flow run.

use crate::error::FlowError;
use crate::metrics::{MetricsRecorder, NoopMetrics};
use crate::path;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// JSON object map used for step payloads and transformer input/output.
pub type Map = serde_json::Map<String, Value>;

/// Handle returned by [`ExecutionContext::with_cancel`] and
/// [`ExecutionContext::with_timeout`].
///
/// Cancelling affects the derived context and every context derived from it,
/// never the parent.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Signals cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Thread-safe key/value store for one flow run.
///
/// Values are `serde_json::Value`s behind a read/write lock, so parallel
/// branches sharing the same context can read and write concurrently. The
/// context also carries the run's identity, an advisory deadline and
/// cancellation signal, the tracing span that steps log into, and the
/// metrics recorder.
///
/// Contexts derived through [`with_timeout`](Self::with_timeout) or
/// [`with_cancel`](Self::with_cancel) share the data map with their parent.
/// [`Clone`] instead produces an independent copy of the data.
///
/// # Examples
///
/// ```
/// use kumiito_core::ExecutionContext;
/// use serde_json::json;
///
/// let ctx = ExecutionContext::new("onboarding");
/// ctx.set("user_id", "u1");
/// ctx.set("profile", json!({"name": "Ann", "age": 31}));
///
/// assert_eq!(ctx.get_string("user_id").unwrap(), "u1");
/// assert_eq!(ctx.get_path("profile.name"), Some(json!("Ann")));
/// assert!(ctx.get_int("user_id").is_err());
/// ```
pub struct ExecutionContext {
    data: Arc<RwLock<HashMap<String, Value>>>,
    execution_id: String,
    flow_name: String,
    started_at: Instant,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    span: Span,
    metrics: Arc<dyn MetricsRecorder>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("flow_name", &self.flow_name)
            .field("keys", &self.keys())
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Clone for ExecutionContext {
    /// Copies the data into a new map. Identity, deadline, cancellation and
    /// sinks are shared with the original.
    fn clone(&self) -> Self {
        Self {
            data: Arc::new(RwLock::new(self.data.read().clone())),
            execution_id: self.execution_id.clone(),
            flow_name: self.flow_name.clone(),
            started_at: self.started_at,
            deadline: self.deadline,
            cancel: self.cancel.clone(),
            span: self.span.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl ExecutionContext {
    /// Creates an empty context for a run of `flow_name`.
    pub fn new(flow_name: impl Into<String>) -> Self {
        let flow_name = flow_name.into();
        let execution_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("flow", flow = %flow_name, execution_id = %execution_id);
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            execution_id,
            flow_name,
            started_at: Instant::now(),
            deadline: None,
            cancel: CancellationToken::new(),
            span,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Creates a context pre-populated with `data`.
    pub fn with_data(flow_name: impl Into<String>, data: Map) -> Self {
        let ctx = Self::new(flow_name);
        ctx.data.write().extend(data);
        ctx
    }

    /// Replaces the metrics recorder.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the unique identifier of this run.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Returns the name of the flow being run.
    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    /// Returns the span steps should log into.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Returns the metrics recorder.
    pub fn metrics(&self) -> &dyn MetricsRecorder {
        self.metrics.as_ref()
    }

    /// Returns the time elapsed since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Stores a value, replacing any previous one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.write().insert(key.into(), value.into());
    }

    /// Removes and returns the value stored under `key`.
    pub fn delete(&self, key: &str) -> Option<Value> {
        self.data.write().remove(key)
    }

    /// Returns `true` if `key` is present.
    pub fn has(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Resolves a dotted path such as `screen.layout.title`.
    ///
    /// A key that literally contains dots wins over nested navigation.
    pub fn get_path(&self, dotted: &str) -> Option<Value> {
        let data = self.data.read();
        if let Some(value) = data.get(dotted) {
            return Some(value.clone());
        }
        let mut segments = dotted.split('.');
        let first = segments.next()?;
        data.get(first)
            .and_then(|root| path::lookup(root, segments))
            .cloned()
    }

    /// Returns the string stored under `key`.
    pub fn get_string(&self, key: &str) -> Result<String, FlowError> {
        match self.require(key)? {
            Value::String(s) => Ok(s),
            other => Err(mismatch(key, "string", &other)),
        }
    }

    /// Returns the integer stored under `key`.
    pub fn get_int(&self, key: &str) -> Result<i64, FlowError> {
        let value = self.require(key)?;
        value
            .as_i64()
            .ok_or_else(|| mismatch(key, "integer", &value))
    }

    /// Returns the number stored under `key` as a float.
    pub fn get_float(&self, key: &str) -> Result<f64, FlowError> {
        let value = self.require(key)?;
        value.as_f64().ok_or_else(|| mismatch(key, "number", &value))
    }

    /// Returns the boolean stored under `key`.
    pub fn get_bool(&self, key: &str) -> Result<bool, FlowError> {
        let value = self.require(key)?;
        value.as_bool().ok_or_else(|| mismatch(key, "bool", &value))
    }

    /// Returns the object stored under `key`.
    pub fn get_map(&self, key: &str) -> Result<Map, FlowError> {
        match self.require(key)? {
            Value::Object(map) => Ok(map),
            other => Err(mismatch(key, "object", &other)),
        }
    }

    fn require(&self, key: &str) -> Result<Value, FlowError> {
        self.get(key).ok_or_else(|| FlowError::NotFound {
            key: key.to_string(),
        })
    }

    /// Returns all keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if the context holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copies the current data into a JSON object.
    pub fn snapshot(&self) -> Map {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Writes every entry of `values` into the context.
    pub fn extend(&self, values: Map) {
        self.data.write().extend(values);
    }

    /// Derives a context sharing this one's data, with its own cancel handle.
    pub fn with_cancel(&self) -> (ExecutionContext, CancelHandle) {
        self.derive(self.deadline)
    }

    /// Derives a context whose deadline is at most `timeout` from now.
    ///
    /// The parent's deadline still applies if it is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> (ExecutionContext, CancelHandle) {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> (ExecutionContext, CancelHandle) {
        let token = self.cancel.child_token();
        let ctx = Self {
            data: Arc::clone(&self.data),
            execution_id: self.execution_id.clone(),
            flow_name: self.flow_name.clone(),
            started_at: self.started_at,
            deadline,
            cancel: token.clone(),
            span: self.span.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        (ctx, CancelHandle { token })
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns `true` once the deadline has passed.
    pub fn is_timed_out(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns `true` once this context or an ancestor was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `true` if the context was cancelled or timed out.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_timed_out()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

fn mismatch(key: &str, expected: &'static str, found: &Value) -> FlowError {
    FlowError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: path::type_name(found),
    }
}
