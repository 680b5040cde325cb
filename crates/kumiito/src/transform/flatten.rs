use async_trait::async_trait;
use kumiito_core::{Map, TransformError, Transformer};
use serde_json::Value;

/// Default key separator.
pub const DEFAULT_SEPARATOR: &str = ".";

/// Default nesting depth flattened before values are kept whole.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Joins nested objects and arrays into single-level keys.
///
/// `{"user": {"tags": ["a"]}}` becomes `{"user.tags[0]": "a"}`: object keys are
/// joined with the separator and array elements get a `[index]` suffix, so
/// [`Unflatten`] can tell arrays from objects keyed `"0"`, `"1"`. Empty objects
/// and arrays are kept as values, and anything nested deeper than the maximum
/// depth is stored whole under its partial key.
#[derive(Debug, Clone)]
pub struct Flatten {
    separator: String,
    max_depth: usize,
}

impl Default for Flatten {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Flatten {
    /// Creates a flattener with the default separator and depth.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key separator.
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Sets the maximum depth.
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn flatten_into(&self, out: &mut Map, key: String, value: &Value, depth: usize) {
        let children: Vec<(String, &Value)> = match value {
            Value::Object(map) if !map.is_empty() => map
                .iter()
                .map(|(k, v)| (format!("{key}{}{k}", self.separator), v))
                .collect(),
            Value::Array(items) if !items.is_empty() => items
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("{key}[{i}]"), v))
                .collect(),
            _ => Vec::new(),
        };

        if children.is_empty() || depth >= self.max_depth {
            out.insert(key, value.clone());
            return;
        }
        for (child_key, value) in children {
            self.flatten_into(out, child_key, value, depth + 1);
        }
    }
}

#[async_trait]
impl Transformer for Flatten {
    async fn transform(&self, input: &Map) -> Result<Map, TransformError> {
        let mut out = Map::new();
        for (key, value) in input {
            self.flatten_into(&mut out, key.clone(), value, 1);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "flatten"
    }
}

/// Rebuilds nested objects from separator-joined keys.
///
/// `[index]` suffixes written by [`Flatten`] become arrays again; plain numeric
/// segments stay object keys. A key whose path runs into a value that is not
/// an object is kept verbatim at the top level. Original keys that themselves
/// contain the separator or end in `[digits]` collide with this encoding.
#[derive(Debug, Clone)]
pub struct Unflatten {
    separator: String,
}

impl Default for Unflatten {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

impl Unflatten {
    /// Creates an unflattener with the default separator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key separator.
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

#[async_trait]
impl Transformer for Unflatten {
    async fn transform(&self, input: &Map) -> Result<Map, TransformError> {
        if self.separator.is_empty() {
            return Err(TransformError::failed(self.name(), "separator is empty"));
        }

        let mut out = Map::new();
        let mut conflicts = Vec::new();

        // plain keys first so nested keys never overwrite them
        let (plain, nested): (Vec<_>, Vec<_>) = input
            .iter()
            .map(|(key, value)| (key, value, self.segments(key)))
            .partition(|(_, _, segments)| segments.len() == 1);
        for (key, value, _) in plain {
            out.insert(key.clone(), value.clone());
        }
        for (key, value, segments) in nested {
            if !insert_path(&mut out, &segments, value.clone()) {
                conflicts.push((key.clone(), value.clone()));
            }
        }

        // the root stays an object whatever its keys look like
        let mut out: Map = out
            .into_iter()
            .map(|(k, v)| (k, restore_arrays(v)))
            .collect();
        for (key, value) in conflicts {
            out.insert(key, value);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "unflatten"
    }
}

impl Unflatten {
    /// Splits a flat key into path segments, peeling `[index]` suffixes into
    /// segments of their own.
    fn segments<'a>(&self, key: &'a str) -> Vec<&'a str> {
        let mut segments = Vec::new();
        for part in key.split(self.separator.as_str()) {
            let mut indices = Vec::new();
            let mut rest = part;
            while let Some(start) = index_suffix(rest) {
                indices.push(&rest[start..]);
                rest = &rest[..start];
            }
            if !rest.is_empty() || indices.is_empty() {
                segments.push(rest);
            }
            segments.extend(indices.into_iter().rev());
        }
        segments
    }
}

/// Returns where a trailing `[digits]` starts, if `segment` has one.
fn index_suffix(segment: &str) -> Option<usize> {
    let inner = segment.strip_suffix(']')?;
    let start = inner.rfind('[')?;
    let digits = &inner[start + 1..];
    (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())).then_some(start)
}

/// Parses an `[index]` segment.
fn parse_index(segment: &str) -> Option<usize> {
    segment.strip_prefix('[')?.strip_suffix(']')?.parse().ok()
}

/// Inserts `value` at `segments`, creating objects on the way.
///
/// Returns `false` without modifying anything when the path is blocked by a
/// non-object value or the target already holds a value.
fn insert_path(root: &mut Map, segments: &[&str], value: Value) -> bool {
    if !path_is_free(root, segments) {
        return false;
    }
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    let mut current = root;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(map) => current = map,
            _ => return false,
        }
    }
    current.insert(last.to_string(), value);
    true
}

fn path_is_free(root: &Map, segments: &[&str]) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    let mut current = root;
    for segment in parents {
        match current.get(*segment) {
            None => return true,
            Some(Value::Object(map)) => current = map,
            Some(_) => return false,
        }
    }
    !current.contains_key(*last)
}

fn restore_arrays(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map: Map = map
                .into_iter()
                .map(|(k, v)| (k, restore_arrays(v)))
                .collect();
            if is_index_keyed(&map) {
                let mut items: Vec<(usize, Value)> = map
                    .into_iter()
                    .filter_map(|(k, v)| parse_index(&k).map(|i| (i, v)))
                    .collect();
                items.sort_by_key(|(i, _)| *i);
                Value::Array(items.into_iter().map(|(_, v)| v).collect())
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

fn is_index_keyed(map: &Map) -> bool {
    !map.is_empty() && (0..map.len()).all(|i| map.contains_key(&format!("[{i}]")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_flatten_nested_and_arrays() {
        let input = map(json!({
            "user": {"name": "Ann", "tags": ["a", "b"]},
            "empty": {},
            "id": 1
        }));
        let output = Flatten::new().transform(&input).await.expect("flattened");
        assert_eq!(
            output,
            map(json!({
                "user.name": "Ann",
                "user.tags[0]": "a",
                "user.tags[1]": "b",
                "empty": {},
                "id": 1
            }))
        );
    }

    #[tokio::test]
    async fn test_flatten_respects_max_depth_and_separator() {
        let input = map(json!({"a": {"b": {"c": {"d": 1}}}}));
        let output = Flatten::new()
            .separator("/")
            .max_depth(2)
            .transform(&input)
            .await
            .expect("flattened");
        assert_eq!(output, map(json!({"a/b": {"c": {"d": 1}}})));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let input = map(json!({
            "screen": {
                "id": "welcome",
                "blocks": [{"kind": "text", "body": "hi"}, {"kind": "image"}],
                "flags": {"new": true}
            },
            "version": 3,
            "empty": []
        }));
        let flat = Flatten::new().transform(&input).await.expect("flattened");
        let restored = Unflatten::new().transform(&flat).await.expect("restored");
        assert_eq!(restored, input);
    }

    #[tokio::test]
    async fn test_round_trip_keeps_numeric_object_keys() {
        for input in [
            map(json!({"0": "a", "1": "b"})),
            map(json!({"a": {"0": "x"}})),
            map(json!({"grid": [["a", "b"], ["c"]], "rows": {"0": [1], "1": {"2": true}}})),
        ] {
            let flat = Flatten::new().transform(&input).await.expect("flattened");
            let restored = Unflatten::new().transform(&flat).await.expect("restored");
            assert_eq!(restored, input);
        }
    }

    #[tokio::test]
    async fn test_flatten_marks_nested_arrays() {
        let input = map(json!({"grid": [["a"], ["b", "c"]]}));
        let output = Flatten::new().transform(&input).await.expect("flattened");
        assert_eq!(
            output,
            map(json!({"grid[0][0]": "a", "grid[1][0]": "b", "grid[1][1]": "c"}))
        );
    }

    #[tokio::test]
    async fn test_unflatten_conflict_keeps_flat_key() {
        let input = map(json!({"a": 1, "a.b": 2, "c.d": 3}));
        let output = Unflatten::new().transform(&input).await.expect("restored");
        assert_eq!(output, map(json!({"a": 1, "a.b": 2, "c": {"d": 3}})));
    }

    #[tokio::test]
    async fn test_unflatten_rejects_empty_separator() {
        let result = Unflatten::new().separator("").transform(&Map::new()).await;
        assert!(matches!(result, Err(TransformError::Failed { .. })));
    }
}
