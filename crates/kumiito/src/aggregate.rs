//! Fan-out step that collects several results into one object.

use async_trait::async_trait;
use futures::future::join_all;
use kumiito_core::{ExecutionContext, FlowError, Map, Step, StepName, Transformer};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

struct Member {
    key: String,
    step: Arc<dyn Step>,
    required: bool,
    default: Value,
}

/// Runs member steps concurrently and gathers their results.
///
/// Every member writes its result to the context under its key. Once all
/// members finish, the values are collected into `{key: value}`, passed
/// through the optional merge transformer and stored under the output key.
///
/// Member keys are cleared before the members start, so only values written
/// during this run are collected. A failing required member, or one that wrote
/// nothing, fails the aggregation. A failing optional member, or one that
/// produced no value, contributes its default instead.
///
/// # Examples
///
/// ```
/// use kumiito::aggregate::AggregationStep;
/// use kumiito::prelude::*;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let home = AggregationStep::builder("home")
///     .required("profile", FnStep::new("load_profile", |ctx| {
///         ctx.set("profile", json!({"name": "Ann"}));
///         Ok(())
///     }))
///     .optional("offers", FnStep::new("load_offers", |_| {
///         Err(FlowError::StepError {
///             step_name: "load_offers".into(),
///             details: "offers service down".into(),
///         })
///     }), json!([]))
///     .build()
///     .unwrap();
///
/// let ctx = ExecutionContext::new("home");
/// home.run(&ctx).await.unwrap();
/// assert_eq!(
///     ctx.get("home"),
///     Some(json!({"profile": {"name": "Ann"}, "offers": []}))
/// );
/// # });
/// ```
pub struct AggregationStep {
    name: StepName,
    members: Vec<Member>,
    output_key: String,
    merge: Option<Arc<dyn Transformer>>,
}

impl fmt::Debug for AggregationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: Vec<(&str, bool)> = self
            .members
            .iter()
            .map(|m| (m.key.as_str(), m.required))
            .collect();
        f.debug_struct("AggregationStep")
            .field("name", &self.name)
            .field("members", &members)
            .field("output_key", &self.output_key)
            .finish()
    }
}

impl AggregationStep {
    /// Starts a builder.
    pub fn builder(name: impl Into<StepName>) -> AggregationBuilder {
        AggregationBuilder {
            name: name.into(),
            members: Vec::new(),
            output_key: None,
            merge: None,
        }
    }

    /// Returns the key the aggregate is stored under.
    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    async fn run_member(member: &Member, ctx: &ExecutionContext) -> Result<(), FlowError> {
        let started = Instant::now();
        let result = member.step.run(ctx).await;
        ctx.metrics().record_step(
            ctx.flow_name(),
            member.step.name().as_str(),
            started.elapsed(),
            result.is_ok(),
        );
        result
    }

    fn collect(
        &self,
        ctx: &ExecutionContext,
        results: Vec<Result<(), FlowError>>,
    ) -> Result<Map, FlowError> {
        let mut collected = Map::new();
        for (member, result) in self.members.iter().zip(results) {
            let value = result.and_then(|()| {
                ctx.get(&member.key).ok_or_else(|| FlowError::NotFound {
                    key: member.key.clone(),
                })
            });
            match value {
                Ok(value) => {
                    collected.insert(member.key.clone(), value);
                }
                Err(e) if member.required => {
                    return Err(FlowError::Aggregation {
                        aggregation: self.name.clone(),
                        step_name: member.step.name(),
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        aggregation = %self.name,
                        step = %member.step.name(),
                        error = %e,
                        "optional member failed, using default"
                    );
                    collected.insert(member.key.clone(), member.default.clone());
                }
            }
        }
        Ok(collected)
    }
}

#[async_trait]
impl Step for AggregationStep {
    async fn run(&self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        debug!(aggregation = %self.name, members = self.members.len(), "aggregating");
        // a member that writes nothing must not pick up an earlier value
        for member in &self.members {
            ctx.delete(&member.key);
        }
        let results = join_all(self.members.iter().map(|m| Self::run_member(m, ctx))).await;
        let mut aggregate = self.collect(ctx, results)?;

        if let Some(merge) = &self.merge {
            let started = Instant::now();
            let result = merge.transform(&aggregate).await;
            ctx.metrics()
                .record_transform(merge.name(), started.elapsed(), result.is_ok());
            aggregate = result?;
        }

        ctx.set(self.output_key.clone(), Value::Object(aggregate));
        Ok(())
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}

/// Builder for [`AggregationStep`].
pub struct AggregationBuilder {
    name: StepName,
    members: Vec<Member>,
    output_key: Option<String>,
    merge: Option<Arc<dyn Transformer>>,
}

impl AggregationBuilder {
    /// Adds a member whose failure fails the aggregation.
    pub fn required<S: Step + 'static>(self, key: impl Into<String>, step: S) -> Self {
        self.member(key.into(), Arc::new(step), true, Value::Null)
    }

    /// Adds a member that falls back to `default` on failure.
    pub fn optional<S: Step + 'static>(
        self,
        key: impl Into<String>,
        step: S,
        default: impl Into<Value>,
    ) -> Self {
        self.member(key.into(), Arc::new(step), false, default.into())
    }

    /// Adds an already shared member.
    pub fn member(
        mut self,
        key: String,
        step: Arc<dyn Step>,
        required: bool,
        default: Value,
    ) -> Self {
        self.members.push(Member {
            key,
            step,
            required,
            default,
        });
        self
    }

    /// Sets the context key for the aggregate (default: the step name).
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Reshapes the collected object before it is stored.
    pub fn merge<T: Transformer + 'static>(mut self, transformer: T) -> Self {
        self.merge = Some(Arc::new(transformer));
        self
    }

    /// Builds the step.
    pub fn build(self) -> Result<AggregationStep, FlowError> {
        if self.members.is_empty() {
            return Err(FlowError::Configuration(format!(
                "Aggregation '{}' has no members",
                self.name
            )));
        }
        let mut keys = HashSet::new();
        if let Some(member) = self.members.iter().find(|m| !keys.insert(m.key.as_str())) {
            return Err(FlowError::Configuration(format!(
                "Aggregation '{}' has duplicate key '{}'",
                self.name, member.key
            )));
        }

        let output_key = self
            .output_key
            .unwrap_or_else(|| self.name.as_str().to_string());
        Ok(AggregationStep {
            name: self.name,
            members: self.members,
            output_key,
            merge: self.merge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::FnTransformer;
    use kumiito_core::FnStep;
    use serde_json::json;
    use std::time::Duration;

    fn writes(name: &'static str, key: &'static str, value: Value) -> FnStep {
        FnStep::new(name, move |ctx| {
            ctx.set(key, value.clone());
            Ok(())
        })
    }

    fn fails(name: &'static str) -> FnStep {
        FnStep::new(name, move |_| {
            Err(FlowError::StepError {
                step_name: StepName::new(name),
                details: "down".to_string(),
            })
        })
    }

    /// Sleeps, then writes `key`.
    #[derive(Debug)]
    struct Slow {
        key: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Step for Slow {
        async fn run(&self, ctx: &ExecutionContext) -> Result<(), FlowError> {
            tokio::time::sleep(self.delay).await;
            ctx.set(self.key, true);
            Ok(())
        }

        fn name(&self) -> StepName {
            StepName::new(self.key)
        }
    }

    #[tokio::test]
    async fn test_collects_required_and_optional() {
        let step = AggregationStep::builder("screen")
            .required("header", writes("load_header", "header", json!({"title": "Hi"})))
            .optional("banner", fails("load_banner"), json!({"visible": false}))
            .optional("footer", FnStep::new("noop", |_| Ok(())), json!(null))
            .output_key("screen_data")
            .build()
            .expect("valid aggregation");

        let ctx = ExecutionContext::new("screens");
        step.run(&ctx).await.expect("aggregated");

        assert_eq!(
            ctx.get("screen_data"),
            Some(json!({
                "header": {"title": "Hi"},
                "banner": {"visible": false},
                "footer": null
            }))
        );
    }

    #[tokio::test]
    async fn test_required_failure_waits_for_all_members() {
        let step = AggregationStep::builder("screen")
            .required("profile", fails("load_profile"))
            .optional("slow", Slow { key: "slow", delay: Duration::from_millis(20) }, json!(false))
            .build()
            .expect("valid aggregation");

        let ctx = ExecutionContext::new("screens");
        let err = step.run(&ctx).await.expect_err("required member fails");

        assert!(ctx.has("slow"));
        assert!(!ctx.has("screen"));
        assert!(matches!(
            err,
            FlowError::Aggregation { ref step_name, .. } if step_name == &"load_profile"
        ));
    }

    #[tokio::test]
    async fn test_required_member_without_result_fails() {
        let step = AggregationStep::builder("screen")
            .required("profile", FnStep::new("noop", |_| Ok(())))
            .build()
            .expect("valid aggregation");

        let err = step
            .run(&ExecutionContext::new("screens"))
            .await
            .expect_err("missing result");
        assert!(matches!(
            err,
            FlowError::Aggregation { ref source, .. } if matches!(**source, FlowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_member_values_are_not_collected() {
        let step = AggregationStep::builder("screen")
            .optional("banner", FnStep::new("noop_banner", |_| Ok(())), json!({"visible": false}))
            .required("profile", FnStep::new("noop_profile", |_| Ok(())))
            .build()
            .expect("valid aggregation");

        let ctx = ExecutionContext::new("screens");
        ctx.set("banner", json!({"visible": true, "from": "earlier stage"}));
        ctx.set("profile", json!({"name": "stale"}));

        let err = step.run(&ctx).await.expect_err("profile was not written");
        assert!(matches!(
            err,
            FlowError::Aggregation { ref source, .. } if matches!(**source, FlowError::NotFound { .. })
        ));
        assert!(!ctx.has("profile"));
        assert!(!ctx.has("banner"));
    }

    #[tokio::test]
    async fn test_merge_transformer_and_default_output_key() {
        let count = FnTransformer::new("count", |input| {
            let mut out = input.clone();
            out.insert("sections".into(), json!(input.len()));
            Ok(out)
        });
        let step = AggregationStep::builder("home")
            .required("a", writes("a", "a", json!(1)))
            .required("b", writes("b", "b", json!(2)))
            .merge(count)
            .build()
            .expect("valid aggregation");

        let ctx = ExecutionContext::new("home");
        step.run(&ctx).await.expect("aggregated");
        assert_eq!(step.output_key(), "home");
        assert_eq!(ctx.get("home"), Some(json!({"a": 1, "b": 2, "sections": 2})));
    }

    #[test]
    fn test_builder_validation() {
        assert!(matches!(
            AggregationStep::builder("empty").build(),
            Err(FlowError::Configuration(_))
        ));
        assert!(matches!(
            AggregationStep::builder("dup")
                .required("a", writes("a", "a", json!(1)))
                .optional("a", writes("b", "a", json!(2)), json!(0))
                .build(),
            Err(FlowError::Configuration(_))
        ));
    }
}
