//! Flow error types.

use crate::step::StepName;
use thiserror::Error;

/// Boxed error used where a collaborator's own error type is carried through.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while running a flow.
///
/// Variants carry the identifiers (step, stage, transformer, key) needed to
/// tell which part of a run produced the failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlowError {
    /// A context key was not present.
    #[error("Key not found in context: {key}")]
    NotFound {
        /// The missing key or path.
        key: String,
    },

    /// A context value had a different JSON type than requested.
    #[error("Type mismatch for key '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        /// The key that was read.
        key: String,
        /// The requested type.
        expected: &'static str,
        /// The type actually stored.
        found: &'static str,
    },

    /// Interpolating or encoding a request template failed.
    #[error("Template error in step '{step_name}': {details}")]
    Template {
        /// The step whose template failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// The outbound call failed below the protocol level
    /// (network, timeout, open circuit).
    #[error("Transport error in step '{step_name}': {source}")]
    Transport {
        /// The step that issued the call.
        step_name: StepName,
        /// The underlying client error.
        #[source]
        source: BoxError,
    },

    /// The final response status was not in the step's expected set.
    #[error("Unexpected status {status} in step '{step_name}', expected one of {expected:?}")]
    UnexpectedStatus {
        /// The step that issued the call.
        step_name: StepName,
        /// The status that was received.
        status: u16,
        /// The accepted statuses.
        expected: Vec<u16>,
    },

    /// A transformer failed.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// A validator rejected the data.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A step failed for a reason of its own.
    #[error("Step failed: {step_name}, details: {details}")]
    StepError {
        /// The name of the step that failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// The run's deadline passed before the stage could start.
    #[error("Timeout occurred in step: {step_name}")]
    Timeout {
        /// The step or stage that observed the deadline.
        step_name: StepName,
    },

    /// The run was cancelled before the stage could start.
    #[error("Cancelled before step: {step_name}")]
    Cancelled {
        /// The step or stage that observed the cancellation.
        step_name: StepName,
    },

    /// A stage of a flow failed; wraps the stage's own error.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        /// The stage name.
        stage: StepName,
        /// The error raised inside the stage.
        #[source]
        source: Box<FlowError>,
    },

    /// A required member of an aggregation failed.
    #[error("Required step '{step_name}' failed in aggregation '{aggregation}': {source}")]
    Aggregation {
        /// The aggregation step name.
        aggregation: StepName,
        /// The failing required member.
        step_name: StepName,
        /// The member's error.
        #[source]
        source: Box<FlowError>,
    },

    /// The flow definition is invalid.
    #[error("Invalid flow configuration: {0}")]
    Configuration(String),
}

impl FlowError {
    /// Returns the innermost error, unwrapping `Stage` layers.
    pub fn root(&self) -> &FlowError {
        match self {
            FlowError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Errors raised by transformers and transformer chains.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TransformError {
    /// A single transformer failed.
    #[error("Transformer '{name}' failed: {details}")]
    Failed {
        /// The transformer name.
        name: String,
        /// Details about the failure.
        details: String,
    },

    /// A member of a sequential chain failed.
    #[error("Chain '{chain}' failed at index {index} ({name}): {source}")]
    Chain {
        /// The chain name.
        chain: String,
        /// Position of the failing member.
        index: usize,
        /// Name of the failing member.
        name: String,
        /// The member's error.
        #[source]
        source: Box<TransformError>,
    },

    /// A member of a parallel chain failed.
    #[error("Parallel chain '{chain}' failed in transformer '{name}': {source}")]
    Parallel {
        /// The chain name.
        chain: String,
        /// Name of the failing member.
        name: String,
        /// The member's error.
        #[source]
        source: Box<TransformError>,
    },
}

impl TransformError {
    /// Creates a [`TransformError::Failed`].
    pub fn failed(name: impl Into<String>, details: impl Into<String>) -> Self {
        TransformError::Failed {
            name: name.into(),
            details: details.into(),
        }
    }
}

/// Errors raised by validators.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ValidationError {
    /// A required top-level field is absent (or empty when configured so).
    #[error("Required field missing: {field}")]
    MissingField {
        /// The missing field.
        field: String,
    },

    /// A required nested path is absent.
    #[error("Required path missing: {path}")]
    MissingPath {
        /// The missing dotted path.
        path: String,
    },

    /// A custom check failed.
    #[error("Validator '{validator}' rejected data: {details}")]
    Invalid {
        /// The validator name.
        validator: String,
        /// Details about the rejection.
        details: String,
    },
}
