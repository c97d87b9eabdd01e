//! Operation keys.
//!
//! Two logically identical requests must produce the same key, so bodies are
//! rendered as canonical JSON: object keys sorted at every depth, no
//! insignificant whitespace.

use serde::Serialize;
use serde_json::Value;

/// Key for `method` + `path` + optional JSON body.
pub fn operation_key(method: &str, path: &str, body: Option<&Value>) -> String {
    let body = body.map(canonical_json).unwrap_or_default();
    format!("{}:{}:{}", method.to_ascii_uppercase(), path, body)
}

/// Key for a request whose body is any serializable value.
pub fn operation_key_for<B: Serialize>(
    method: &str,
    path: &str,
    body: Option<&B>,
) -> Result<String, serde_json::Error> {
    let body = body.map(serde_json::to_value).transpose()?;
    Ok(operation_key(method, path, body.as_ref()))
}

/// Render `value` with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
