//! Core contracts and types for the kumiito flow engine.
//!
//! This crate holds the abstractions shared by the runtime and by code that
//! implements its own steps, transformers or validators.
//!
//! # Core Types
//!
//! - [`ExecutionContext`] - Thread-safe working memory of one flow run
//! - [`Step`] - A unit of work run against the context
//! - [`Transformer`] - Reshapes a JSON object
//! - [`Validator`] - Checks a JSON object
//! - [`MetricsRecorder`] - Narrow metrics sink
//! - [`FlowError`] - Error types for flow execution

mod context;
mod error;
mod metrics;
pub mod path;
mod step;
mod transform;

pub use context::{CancelHandle, ExecutionContext, Map};
pub use error::{BoxError, FlowError, TransformError, ValidationError};
pub use metrics::{MetricsRecorder, NoopMetrics, Tags};
pub use step::{FnStep, Step, StepName};
pub use transform::{Transformer, Validator};
