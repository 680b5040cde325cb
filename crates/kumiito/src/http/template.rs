//! `${path}` interpolation against the execution context.
//!
//! Unresolved placeholders are left in place verbatim so partially filled
//! templates stay readable in logs and requests.

use kumiito_core::{ExecutionContext, Map};
use serde_json::Value;

const OPEN: &str = "${";
const CLOSE: char = '}';

/// Replaces every `${key}` / `${a.b.c}` token in `template`.
///
/// Strings are inserted raw, other values as compact JSON.
pub fn interpolate(template: &str, ctx: &ExecutionContext) -> String {
    interpolate_with(template, ctx, render)
}

/// Like [`interpolate`], but percent-encodes every resolved value so it fills
/// exactly one URL component. `/`, `?`, `&` and `#` in a value cannot change
/// the shape of the URL.
pub fn interpolate_url(template: &str, ctx: &ExecutionContext) -> String {
    interpolate_with(template, ctx, |value| {
        urlencoding::encode(&render(value)).into_owned()
    })
}

fn interpolate_with<F>(template: &str, ctx: &ExecutionContext, render: F) -> String
where
    F: Fn(&Value) -> String,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        match after.find(CLOSE) {
            Some(end) => {
                let path = after[..end].trim();
                match ctx.get_path(path) {
                    Some(value) if !path.is_empty() => out.push_str(&render(&value)),
                    _ => out.push_str(&rest[start..start + OPEN.len() + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Interpolates every string inside a JSON value.
///
/// A string that is exactly one placeholder is replaced by the resolved value
/// itself, keeping its JSON type.
pub fn interpolate_value(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => match single_placeholder(s).and_then(|path| ctx.get_path(path)) {
            Some(resolved) => resolved,
            None => Value::String(interpolate(s, ctx)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(interpolate_map(map, ctx)),
        other => other.clone(),
    }
}

/// Interpolates every value of a JSON object.
pub fn interpolate_map(map: &Map, ctx: &ExecutionContext) -> Map {
    map.iter()
        .map(|(k, v)| (k.clone(), interpolate_value(v, ctx)))
        .collect()
}

fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(CLOSE) || inner.contains(OPEN) {
        return None;
    }
    Some(inner.trim())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
