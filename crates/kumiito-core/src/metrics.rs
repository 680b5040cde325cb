//! Narrow metrics recording interface.
//!
//! The engine reports through [`MetricsRecorder`]; adapters for a concrete
//! backend live outside this crate.

use std::collections::HashMap;
use std::time::Duration;

/// String tags attached to a metric sample.
pub type Tags = HashMap<String, String>;

fn tags<const N: usize>(pairs: [(&str, String); N]) -> Tags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Sink for counters, gauges and histograms.
///
/// Only the three primitive methods are required; the convenience recorders
/// map flow, step, HTTP, cache, transform and validation events onto them.
pub trait MetricsRecorder: Send + Sync {
    /// Adds `value` to a counter.
    fn increment_counter(&self, name: &str, value: u64, tags: &Tags);

    /// Sets a gauge.
    fn set_gauge(&self, name: &str, value: f64, tags: &Tags);

    /// Records a histogram sample.
    fn record_histogram(&self, name: &str, value: f64, tags: &Tags);

    /// Records the completion of a flow run.
    fn record_flow(&self, flow: &str, duration: Duration, success: bool) {
        let tags = tags([("flow", flow.to_string()), ("success", success.to_string())]);
        self.increment_counter("flow_executions_total", 1, &tags);
        self.record_histogram("flow_duration_seconds", duration.as_secs_f64(), &tags);
    }

    /// Records the completion of one stage.
    fn record_step(&self, flow: &str, step: &str, duration: Duration, success: bool) {
        let tags = tags([
            ("flow", flow.to_string()),
            ("step", step.to_string()),
            ("success", success.to_string()),
        ]);
        self.increment_counter("step_executions_total", 1, &tags);
        self.record_histogram("step_duration_seconds", duration.as_secs_f64(), &tags);
    }

    /// Records an outbound HTTP call.
    fn record_http(&self, method: &str, url: &str, status: u16, duration: Duration) {
        let tags = tags([
            ("method", method.to_string()),
            ("url", url.to_string()),
            ("status", status.to_string()),
        ]);
        self.increment_counter("http_requests_total", 1, &tags);
        self.record_histogram("http_request_duration_seconds", duration.as_secs_f64(), &tags);
    }

    /// Records a cache lookup.
    fn record_cache(&self, cache: &str, hit: bool) {
        let tags = tags([("cache", cache.to_string()), ("hit", hit.to_string())]);
        self.increment_counter("cache_lookups_total", 1, &tags);
    }

    /// Records a transformer invocation.
    fn record_transform(&self, transformer: &str, duration: Duration, success: bool) {
        let tags = tags([
            ("transformer", transformer.to_string()),
            ("success", success.to_string()),
        ]);
        self.increment_counter("transform_executions_total", 1, &tags);
        self.record_histogram("transform_duration_seconds", duration.as_secs_f64(), &tags);
    }

    /// Records a validator invocation.
    fn record_validation(&self, validator: &str, success: bool) {
        let tags = tags([
            ("validator", validator.to_string()),
            ("success", success.to_string()),
        ]);
        self.increment_counter("validation_executions_total", 1, &tags);
    }
}

/// Recorder that drops every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn increment_counter(&self, _name: &str, _value: u64, _tags: &Tags) {}

    fn set_gauge(&self, _name: &str, _value: f64, _tags: &Tags) {}

    fn record_histogram(&self, _name: &str, _value: f64, _tags: &Tags) {}
}
