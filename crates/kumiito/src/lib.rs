//! Resilient service-call flows for backend-for-frontend layers.
//!
//! A [`Flow`] is a named sequence of stages run against one
//! [`ExecutionContext`]: plain steps, transforms of the context, conditional
//! branches and parallel groups. The richest step, [`HttpStep`], calls a
//! service through a [`ResilientClient`] (fallback, retry, circuit breaker and
//! timeout) and writes the shaped response back to the context.
//!
//! # Example
//!
//! ```rust,no_run
//! use kumiito::prelude::*;
//! use kumiito::transform::FieldSelector;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     kumiito::telemetry::init_tracing();
//!
//!     let config = ResilienceConfig::builder()
//!         .max_retries(2)
//!         .fallback(200, r#"{"blocks":[]}"#)
//!         .build()?;
//!     let client = Arc::new(ResilientClient::new("screens", config)?);
//!
//!     let fetch = HttpStep::builder("fetch_screen", client)
//!         .get("https://screens.internal/api/screens/${screen_id}")
//!         .query("user_id", "${user_id}")
//!         .transformer(Arc::new(FieldSelector::new(["id", "title", "blocks"])))
//!         .result_key("screen")
//!         .build()?;
//!
//!     let flow = Flow::builder("screen")
//!         .timeout(std::time::Duration::from_secs(2))
//!         .step(fetch)
//!         .build()?;
//!
//!     let ctx = ExecutionContext::new("screen");
//!     ctx.set("screen_id", "welcome");
//!     ctx.set("user_id", "u1");
//!     flow.execute(&ctx).await.into_result()?;
//!     println!("{:?}", ctx.get("screen"));
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod flow;
pub mod http;
pub mod resilience;
pub mod telemetry;
pub mod transform;
pub mod validate;

// Re-export core types
pub use kumiito_core::*;

pub use aggregate::{AggregationBuilder, AggregationStep};
pub use flow::{BranchIsolation, Flow, FlowBuilder, FlowResult, Stage, StageKind, StageRecord};
pub use http::{HttpStep, HttpStepBuilder, HTTP_METADATA_KEY};
pub use resilience::{ResilienceConfig, ResilientClient};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        AggregationStep, BranchIsolation, ExecutionContext, Flow, FlowBuilder, FlowError,
        FlowResult, FnStep, HttpStep, Map, ResilienceConfig, ResilientClient, Stage, Step,
        StepName, TransformError, Transformer, ValidationError, Validator,
    };
}
