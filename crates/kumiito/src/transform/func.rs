use async_trait::async_trait;
use kumiito_core::{Map, TransformError, Transformer};
use std::fmt;

type TransformFn = dyn Fn(&Map) -> Result<Map, TransformError> + Send + Sync;

/// Transformer backed by a closure.
///
/// # Examples
///
/// ```
/// use kumiito::transform::FnTransformer;
/// use kumiito::Transformer;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let upper = FnTransformer::new("upper_title", |input| {
///     let mut out = input.clone();
///     if let Some(title) = input.get("title").and_then(|v| v.as_str()) {
///         out.insert("title".into(), json!(title.to_uppercase()));
///     }
///     Ok(out)
/// });
///
/// let mut input = kumiito::Map::new();
/// input.insert("title".into(), json!("welcome"));
/// let output = upper.transform(&input).await.unwrap();
/// assert_eq!(output["title"], json!("WELCOME"));
/// # });
/// ```
pub struct FnTransformer {
    name: String,
    func: Box<TransformFn>,
}

impl FnTransformer {
    /// Wraps `func` under `name`.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Map) -> Result<Map, TransformError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for FnTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransformer")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl Transformer for FnTransformer {
    async fn transform(&self, input: &Map) -> Result<Map, TransformError> {
        (self.func)(input)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
