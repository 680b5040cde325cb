use async_trait::async_trait;
use kumiito_core::{path, Map, TransformError, Transformer};
use serde_json::Value;

/// Key prefixes treated as response metadata.
pub const METADATA_PREFIXES: [&str; 4] = ["_meta", "_metadata", "_info", "_debug"];

/// Returns `true` if `key` starts with one of [`METADATA_PREFIXES`].
pub fn is_metadata_key(key: &str) -> bool {
    METADATA_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// Keeps a whitelist of fields, optionally renaming them.
///
/// Fields may be dotted paths (`user.profile.name`); the value is looked up by
/// literal key first, then by walking nested objects. Output keys are the
/// field names as written, with dots replaced by the separator when
/// [`flatten_keys`](Self::flatten_keys) is set, and prefixed with
/// `prefix + separator` when a prefix is configured. Missing fields are
/// skipped.
///
/// An empty whitelist selects every non-metadata key. Metadata keys are only
/// copied through when [`include_metadata`](Self::include_metadata) is set.
#[derive(Debug, Clone)]
pub struct FieldSelector {
    name: String,
    fields: Vec<String>,
    prefix: Option<String>,
    separator: String,
    include_metadata: bool,
    flatten_keys: bool,
}

impl FieldSelector {
    /// Creates a selector keeping `fields`.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: "field_selector".to_string(),
            fields: fields.into_iter().map(Into::into).collect(),
            prefix: None,
            separator: "_".to_string(),
            include_metadata: false,
            flatten_keys: false,
        }
    }

    /// Sets the transformer name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Prefixes every selected output key.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets the separator used for prefixes and flattened keys (default `_`).
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Copies metadata-prefixed keys through unchanged.
    pub fn include_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    /// Joins dotted field names with the separator in output keys.
    pub fn flatten_keys(mut self, flatten: bool) -> Self {
        self.flatten_keys = flatten;
        self
    }

    fn output_key(&self, field: &str) -> String {
        let key = if self.flatten_keys {
            field.replace('.', &self.separator)
        } else {
            field.to_string()
        };
        match &self.prefix {
            Some(prefix) => format!("{prefix}{}{key}", self.separator),
            None => key,
        }
    }

    fn lookup(input: &Map, field: &str) -> Option<Value> {
        if let Some(value) = input.get(field) {
            return Some(value.clone());
        }
        let (head, rest) = field.split_once('.')?;
        path::lookup_dotted(input.get(head)?, rest).cloned()
    }
}

#[async_trait]
impl Transformer for FieldSelector {
    async fn transform(&self, input: &Map) -> Result<Map, TransformError> {
        let mut output = Map::new();

        if self.fields.is_empty() {
            for (key, value) in input.iter().filter(|(key, _)| !is_metadata_key(key)) {
                output.insert(self.output_key(key), value.clone());
            }
        } else {
            for field in &self.fields {
                if let Some(value) = Self::lookup(input, field) {
                    output.insert(self.output_key(field), value);
                }
            }
        }

        if self.include_metadata {
            for (key, value) in input.iter().filter(|(key, _)| is_metadata_key(key)) {
                output.insert(key.clone(), value.clone());
            }
        }
        Ok(output)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
