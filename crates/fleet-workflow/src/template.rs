//! `{{path.to.field}}` templating for step config (§4.8): string values
//! are resolved against the run's context, everything else passes
//! through recursively untouched.
//!
//! A config value that is exactly one placeholder (`"{{file}}"`)
//! resolves to the context value's own JSON type — this lets a step
//! receive, say, a boolean or nested object from the context rather
//! than always getting a stringified placeholder. A value with a
//! placeholder embedded in surrounding text is resolved as a string,
//! substituting the looked-up value's display form.

use serde_json::Value;

pub fn resolve(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => resolve_string(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let s = s.trim();
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn resolve_string(s: &str, context: &Value) -> Value {
    if let Some(path) = whole_placeholder(s) {
        return lookup_path(context, path).cloned().unwrap_or(Value::Null);
    }

    let mut result = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        match rest[start..].find("}}") {
            Some(rel_end) => {
                let end = start + rel_end;
                let path = rest[start + 2..end].trim();
                let looked_up = lookup_path(context, path);
                result.push_str(&display(looked_up));
                rest = &rest[end + 2..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);
    Value::String(result)
}

fn lookup_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(context, |acc, part| acc.get(part))
}

fn display(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_string_placeholder_preserves_type() {
        let context = json!({"count": 7, "file": "/tmp/x.csv"});
        assert_eq!(resolve(&json!("{{count}}"), &context), json!(7));
        assert_eq!(resolve(&json!("{{file}}"), &context), json!("/tmp/x.csv"));
    }

    #[test]
    fn embedded_placeholder_stringifies() {
        let context = json!({"fileName": "report.csv", "timestamp": "2026-01-01T00:00:00Z"});
        let resolved = resolve(
            &json!("archive/{{timestamp}}-{{fileName}}"),
            &context,
        );
        assert_eq!(
            resolved,
            json!("archive/2026-01-01T00:00:00Z-report.csv")
        );
    }

    #[test]
    fn missing_path_resolves_to_empty_or_null() {
        let context = json!({});
        assert_eq!(resolve(&json!("{{missing}}"), &context), Value::Null);
        assert_eq!(resolve(&json!("pre-{{missing}}-post"), &context), json!("pre--post"));
    }

    #[test]
    fn nested_objects_and_arrays_resolve_recursively() {
        let context = json!({"bucket": "my-bucket", "key": "obj.bin"});
        let config = json!({
            "target": {"bucket": "{{bucket}}", "keys": ["{{key}}", "static"]},
        });
        let resolved = resolve(&config, &context);
        assert_eq!(
            resolved,
            json!({"target": {"bucket": "my-bucket", "keys": ["obj.bin", "static"]}})
        );
    }
}
