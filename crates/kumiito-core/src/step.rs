//! Step trait and related types.

use crate::context::ExecutionContext;
use crate::error::FlowError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A unit of work run against an [`ExecutionContext`].
///
/// Steps communicate only through side effects on the context: they read
/// their inputs from it and write their results back.
///
/// # Examples
///
/// ```
/// use kumiito_core::{ExecutionContext, FlowError, Step, StepName};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct GreetStep;
///
/// #[async_trait]
/// impl Step for GreetStep {
///     async fn run(&self, ctx: &ExecutionContext) -> Result<(), FlowError> {
///         let name = ctx.get_string("name")?;
///         ctx.set("greeting", format!("hello {name}"));
///         Ok(())
///     }
///
///     fn name(&self) -> StepName {
///         StepName::new("greet")
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Executes the step against the context.
    async fn run(&self, ctx: &ExecutionContext) -> Result<(), FlowError>;

    /// Returns the step name.
    fn name(&self) -> StepName;
}

type StepFn = dyn Fn(&ExecutionContext) -> Result<(), FlowError> + Send + Sync;

/// A step backed by a synchronous closure.
///
/// Useful for small glue steps that only move values around in the context.
pub struct FnStep {
    name: StepName,
    func: Box<StepFn>,
}

impl FnStep {
    /// Creates a step from a name and a closure.
    pub fn new<F>(name: impl Into<StepName>, func: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<(), FlowError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Step for FnStep {
    async fn run(&self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        (self.func)(ctx)
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_name() {
        let name = StepName::new("test");
        assert_eq!(name.as_str(), "test");

        let name: StepName = "test".into();
        assert_eq!(name, "test");
    }

    #[tokio::test]
    async fn test_fn_step_writes_context() {
        let step = FnStep::new("copy", |ctx| {
            let value = ctx.get_int("input")?;
            ctx.set("output", value * 2);
            Ok(())
        });
        let ctx = ExecutionContext::new("test");
        ctx.set("input", json!(21));

        step.run(&ctx).await.expect("step should succeed");
        assert_eq!(ctx.get("output"), Some(json!(42)));
        assert_eq!(step.name(), "copy");
    }

    #[tokio::test]
    async fn test_fn_step_propagates_error() {
        let step = FnStep::new("read", |ctx| ctx.get_string("missing").map(|_| ()));
        let ctx = ExecutionContext::new("test");

        let err = step.run(&ctx).await.expect_err("missing key");
        assert!(matches!(err, FlowError::NotFound { .. }));
    }
}
