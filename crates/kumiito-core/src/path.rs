//! Dotted-path navigation over JSON values.

use serde_json::Value;

/// Follows `segments` through nested objects and arrays.
///
/// Array elements are addressed by their decimal index.
pub fn lookup<'a, I, S>(root: &'a Value, segments: I) -> Option<&'a Value>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    segments
        .into_iter()
        .try_fold(root, |current, segment| step_into(current, segment.as_ref()))
}

/// Looks up a dotted path such as `user.profile.name` or `items.0.id`.
pub fn lookup_dotted<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    lookup(root, path.split('.'))
}

fn step_into<'a>(current: &'a Value, segment: &str) -> Option<&'a Value> {
    match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Returns the JSON type name of a value, used in type-mismatch errors.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
