//! Result envelope and rendering.
//!
//! Every command prints exactly one document on stdout:
//! `{"ok": true, "result": ...}` or
//! `{"ok": false, "error": {"type": ..., "message": ...}}`.
//! JSON output is pretty-printed with sorted keys.

use humansize::{format_size, BINARY};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{GraphMailError, Result};

/// Output format selected with `--format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            _ => Err(GraphMailError::Config(
                "--format must be one of: json, text".to_string(),
            )),
        }
    }
}

/// Wrap a serializable result in the success envelope.
pub fn success(result: &impl Serialize) -> Value {
    let result = serde_json::to_value(result)
        .unwrap_or_else(|e| Value::String(format!("<unserializable result: {e}>")));
    json!({ "ok": true, "result": result })
}

/// Error envelope with a stable kind name.
pub fn failure(kind: &str, message: &str) -> Value {
    json!({ "ok": false, "error": { "type": kind, "message": message } })
}

/// Render an envelope in the requested format.
pub fn render(payload: &Value, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
        }
        OutputFormat::Text => {
            if payload.get("ok").and_then(Value::as_bool) == Some(true) {
                render_text(payload.get("result").unwrap_or(&Value::Null))
            } else {
                let error = payload.get("error").unwrap_or(&Value::Null);
                format!(
                    "ERROR [{}]: {}",
                    scalar(error.get("type").unwrap_or(&Value::Null)),
                    scalar(error.get("message").unwrap_or(&Value::Null)),
                )
            }
        }
    }
}

/// Human-readable rendering of a result.
///
/// Objects print one `key: value` line per field in key order, with nested
/// values as indented JSON. Byte counts get a human-readable size.
pub fn render_text(result: &Value) -> String {
    match result {
        Value::Array(items) => items
            .iter()
            .map(|item| format!("- {item}"))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => {
            let mut lines = Vec::with_capacity(map.len());
            for (key, value) in map {
                match value {
                    Value::Object(_) | Value::Array(_) => {
                        lines.push(format!("{key}:"));
                        lines.push(
                            serde_json::to_string_pretty(value)
                                .unwrap_or_else(|_| value.to_string()),
                        );
                    }
                    Value::Number(n) if is_byte_count(key) => match n.as_u64() {
                        Some(bytes) => {
                            lines.push(format!("{key}: {bytes} ({})", format_size(bytes, BINARY)))
                        }
                        None => lines.push(format!("{key}: {n}")),
                    },
                    other => lines.push(format!("{key}: {}", scalar(other))),
                }
            }
            lines.join("\n")
        }
        other => scalar(other),
    }
}

fn is_byte_count(key: &str) -> bool {
    key == "size" || key.ends_with("_bytes")
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_sorts_keys() {
        let payload = success(&json!({"zeta": 1, "alpha": 2}));
        let rendered = render(&payload, OutputFormat::Json);
        assert!(rendered.find("\"alpha\"").unwrap() < rendered.find("\"zeta\"").unwrap());
        assert!(rendered.find("\"ok\"").unwrap() < rendered.find("\"result\"").unwrap());
    }

    #[test]
    fn test_failure_text() {
        let payload = failure("AuthError", "Run auth login first.");
        assert_eq!(
            render(&payload, OutputFormat::Text),
            "ERROR [AuthError]: Run auth login first."
        );
        assert_eq!(payload["error"]["type"], "AuthError");
    }

    #[test]
    fn test_render_text_object() {
        let text = render_text(&json!({
            "saved_path": "/tmp/a.pdf",
            "size_bytes": 2048,
            "failed": [],
            "ok_flag": true
        }));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "failed:");
        assert_eq!(lines[1], "[]");
        assert_eq!(lines[2], "ok_flag: true");
        assert_eq!(lines[3], "saved_path: /tmp/a.pdf");
        assert_eq!(lines[4], "size_bytes: 2048 (2 KiB)");
    }

    #[test]
    fn test_render_text_list_and_scalar() {
        assert_eq!(render_text(&json!([{"a": 1}, 2])), "- {\"a\":1}\n- 2");
        assert_eq!(render_text(&json!("done")), "done");
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(OutputFormat::parse(" JSON ").unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("text").unwrap(), OutputFormat::Text);
        assert!(OutputFormat::parse("yaml").is_err());
    }
}
