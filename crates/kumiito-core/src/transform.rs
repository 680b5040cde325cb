//! Transformer and validator contracts.

use crate::context::Map;
use crate::error::{TransformError, ValidationError};
use async_trait::async_trait;

/// Reshapes a JSON object into another.
///
/// Implementations must not mutate shared state; the same transformer may be
/// invoked concurrently by parallel chains and by many flow runs.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Produces a new map from `input`.
    async fn transform(&self, input: &Map) -> Result<Map, TransformError>;

    /// Returns the transformer name used in error reports.
    fn name(&self) -> &str;
}

/// Checks a JSON object without modifying it.
pub trait Validator: Send + Sync {
    /// Returns an error describing the first problem found.
    fn validate(&self, data: &Map) -> Result<(), ValidationError>;

    /// Returns the validator name used in metrics.
    fn name(&self) -> &str {
        "validator"
    }
}
