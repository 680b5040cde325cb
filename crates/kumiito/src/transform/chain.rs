//! Transformer combinators.

use async_trait::async_trait;
use futures::future::join_all;
use kumiito_core::{Map, TransformError, Transformer};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Predicate over a transformer input.
pub type Predicate = Arc<dyn Fn(&Map) -> bool + Send + Sync>;

/// Merges parallel results, given in declaration order.
pub type MergeFn = Arc<dyn Fn(Vec<Map>) -> Map + Send + Sync>;

/// Runs transformers one after another, each consuming the previous output.
#[derive(Clone)]
pub struct SequentialChain {
    name: String,
    transformers: Vec<Arc<dyn Transformer>>,
}

impl SequentialChain {
    /// Creates an empty chain.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transformers: Vec::new(),
        }
    }

    /// Appends a transformer.
    pub fn then(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    /// Returns `true` if the chain has no members.
    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

impl fmt::Debug for SequentialChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialChain")
            .field("name", &self.name)
            .field("transformers", &names(&self.transformers))
            .finish()
    }
}

#[async_trait]
impl Transformer for SequentialChain {
    async fn transform(&self, input: &Map) -> Result<Map, TransformError> {
        let mut current = input.clone();
        for (index, transformer) in self.transformers.iter().enumerate() {
            current = transformer
                .transform(&current)
                .await
                .map_err(|source| TransformError::Chain {
                    chain: self.name.clone(),
                    index,
                    name: transformer.name().to_string(),
                    source: Box::new(source),
                })?;
        }
        Ok(current)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs transformers concurrently on the same input and merges their outputs.
///
/// Outputs are merged in declaration order, so with the default merge a later
/// member overwrites keys produced by an earlier one regardless of which
/// finished first.
#[derive(Clone)]
pub struct ParallelChain {
    name: String,
    transformers: Vec<Arc<dyn Transformer>>,
    merge: MergeFn,
}

impl ParallelChain {
    /// Creates an empty chain using [`merge_overwrite`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transformers: Vec::new(),
            merge: Arc::new(merge_overwrite),
        }
    }

    /// Adds a member.
    pub fn with(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Replaces the merge function.
    pub fn merge_with<F>(mut self, merge: F) -> Self
    where
        F: Fn(Vec<Map>) -> Map + Send + Sync + 'static,
    {
        self.merge = Arc::new(merge);
        self
    }
}

impl fmt::Debug for ParallelChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelChain")
            .field("name", &self.name)
            .field("transformers", &names(&self.transformers))
            .finish()
    }
}

#[async_trait]
impl Transformer for ParallelChain {
    async fn transform(&self, input: &Map) -> Result<Map, TransformError> {
        let results = join_all(self.transformers.iter().map(|t| t.transform(input))).await;

        let mut outputs = Vec::with_capacity(results.len());
        for (transformer, result) in self.transformers.iter().zip(results) {
            match result {
                Ok(output) => outputs.push(output),
                Err(source) => {
                    return Err(TransformError::Parallel {
                        chain: self.name.clone(),
                        name: transformer.name().to_string(),
                        source: Box::new(source),
                    })
                }
            }
        }
        Ok((self.merge)(outputs))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Default parallel merge: later maps overwrite earlier keys.
pub fn merge_overwrite(outputs: Vec<Map>) -> Map {
    let mut merged = Map::new();
    for output in outputs {
        merged.extend(output);
    }
    merged
}

/// Picks the first transformer whose predicate matches its input.
#[derive(Clone)]
pub struct ConditionalChain {
    name: String,
    branches: Vec<(Predicate, Arc<dyn Transformer>)>,
    fallback: Option<Arc<dyn Transformer>>,
}

impl ConditionalChain {
    /// Creates a chain with no branches.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branches: Vec::new(),
            fallback: None,
        }
    }

    /// Adds a branch; branches are tried in the order they were added.
    pub fn when<P>(mut self, predicate: P, transformer: Arc<dyn Transformer>) -> Self
    where
        P: Fn(&Map) -> bool + Send + Sync + 'static,
    {
        self.branches.push((Arc::new(predicate), transformer));
        self
    }

    /// Sets the transformer used when no branch matches.
    pub fn otherwise(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.fallback = Some(transformer);
        self
    }
}

impl fmt::Debug for ConditionalChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let branches: Vec<&str> = self.branches.iter().map(|(_, t)| t.name()).collect();
        f.debug_struct("ConditionalChain")
            .field("name", &self.name)
            .field("branches", &branches)
            .field("fallback", &self.fallback.as_ref().map(|t| t.name()))
            .finish()
    }
}

#[async_trait]
impl Transformer for ConditionalChain {
    async fn transform(&self, input: &Map) -> Result<Map, TransformError> {
        let selected = self
            .branches
            .iter()
            .find(|(predicate, _)| predicate(input))
            .map(|(_, transformer)| transformer)
            .or(self.fallback.as_ref());

        match selected {
            Some(transformer) => {
                debug!(chain = %self.name, transformer = transformer.name(), "branch selected");
                transformer.transform(input).await
            }
            None => Ok(input.clone()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn names(transformers: &[Arc<dyn Transformer>]) -> Vec<&str> {
    transformers.iter().map(|t| t.name()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::FnTransformer;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn map(value: Value) -> Map {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn set(name: &str, key: &'static str, value: i64) -> Arc<dyn Transformer> {
        Arc::new(FnTransformer::new(name, move |input| {
            let mut out = input.clone();
            out.insert(key.to_string(), json!(value));
            Ok(out)
        }))
    }

    fn failing(name: &str) -> Arc<dyn Transformer> {
        let owned = name.to_string();
        Arc::new(FnTransformer::new(name, move |_| {
            Err(TransformError::failed(owned.clone(), "boom"))
        }))
    }

    /// Delays before emitting `{key: value}` only.
    struct Slow {
        name: String,
        delay: Duration,
        key: &'static str,
        value: i64,
    }

    #[async_trait]
    impl Transformer for Slow {
        async fn transform(&self, _input: &Map) -> Result<Map, TransformError> {
            tokio::time::sleep(self.delay).await;
            let mut out = Map::new();
            out.insert(self.key.to_string(), json!(self.value));
            Ok(out)
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn test_sequential_feeds_output_forward() {
        let double = Arc::new(FnTransformer::new("double", |input: &Map| {
            let n = input.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(map(json!({ "n": n * 2 })))
        }));
        let chain = SequentialChain::new("shape")
            .then(set("seed", "n", 3))
            .then(double);

        let output = chain.transform(&Map::new()).await.expect("chain succeeds");
        assert_eq!(output.get("n"), Some(&json!(6)));
    }

    #[tokio::test]
    async fn test_sequential_failure_reports_index_and_name() {
        let chain = SequentialChain::new("shape")
            .then(set("a", "a", 1))
            .then(failing("strip"));

        let err = chain.transform(&Map::new()).await.expect_err("second fails");
        assert!(matches!(
            err,
            TransformError::Chain { ref chain, index: 1, ref name, .. }
                if chain == "shape" && name == "strip"
        ));
    }

    #[tokio::test]
    async fn test_empty_sequential_returns_copy() {
        let input = map(json!({"a": 1}));
        let chain = SequentialChain::new("empty");
        assert!(chain.is_empty());
        assert_eq!(chain.transform(&input).await.expect("copy"), input);
    }

    #[tokio::test]
    async fn test_parallel_merges_in_declaration_order() {
        // the first member finishes last but is merged first
        let chain = ParallelChain::new("fan")
            .with(Arc::new(Slow {
                name: "slow".into(),
                delay: Duration::from_millis(30),
                key: "winner",
                value: 1,
            }))
            .with(Arc::new(Slow {
                name: "fast".into(),
                delay: Duration::ZERO,
                key: "winner",
                value: 2,
            }));

        let output = chain.transform(&Map::new()).await.expect("merged");
        assert_eq!(output.get("winner"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_parallel_members_see_original_input() {
        let chain = ParallelChain::new("fan")
            .with(set("a", "a", 1))
            .with(set("b", "b", 2));
        let output = chain
            .transform(&map(json!({"base": true})))
            .await
            .expect("merged");
        assert_eq!(output, map(json!({"base": true, "a": 1, "b": 2})));
    }

    #[tokio::test]
    async fn test_parallel_failure_names_transformer() {
        let chain = ParallelChain::new("fan")
            .with(set("a", "a", 1))
            .with(failing("broken"));
        let err = chain.transform(&Map::new()).await.expect_err("fails");
        assert!(matches!(err, TransformError::Parallel { ref name, .. } if name == "broken"));
    }

    #[tokio::test]
    async fn test_parallel_custom_merge() {
        let chain = ParallelChain::new("count")
            .with(set("a", "a", 1))
            .with(set("b", "b", 2))
            .merge_with(|outputs| map(json!({ "members": outputs.len() })));
        let output = chain.transform(&Map::new()).await.expect("merged");
        assert_eq!(output.get("members"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_conditional_first_match_fallback_and_passthrough() {
        let is_ios = |input: &Map| input.get("platform") == Some(&json!("ios"));
        let always = |_: &Map| true;
        let chain = ConditionalChain::new("platform")
            .when(is_ios, set("ios", "layout", 1))
            .when(always, set("any", "layout", 2));

        let ios = chain.transform(&map(json!({"platform": "ios"}))).await.expect("ok");
        assert_eq!(ios.get("layout"), Some(&json!(1)));
        let web = chain.transform(&map(json!({"platform": "web"}))).await.expect("ok");
        assert_eq!(web.get("layout"), Some(&json!(2)));

        let never = |_: &Map| false;
        let with_fallback = ConditionalChain::new("fb")
            .when(never, set("x", "x", 1))
            .otherwise(set("fallback", "fallback", 1));
        let output = with_fallback.transform(&Map::new()).await.expect("ok");
        assert_eq!(output.get("fallback"), Some(&json!(1)));

        let passthrough = ConditionalChain::new("none").when(never, set("x", "x", 1));
        let input = map(json!({"keep": true}));
        assert_eq!(passthrough.transform(&input).await.expect("copy"), input);
    }
}
