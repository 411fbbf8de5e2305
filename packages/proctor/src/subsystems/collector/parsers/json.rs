//! Generic JSON results: either a top-level array of rows or an object
//! with a `tests` array. The escape hatch for custom tooling; unknown
//! fields are preserved in metadata.

use proctor_types::{ResultFormat, TestStatus};
use serde_json::Value;

use super::{ParseError, ParsedResult};

const KNOWN_FIELDS: &[&str] = &[
    "name", "suite", "status", "duration_ms", "message", "error_message", "stack", "stack_trace",
];

pub fn parse(bytes: &[u8]) -> Result<Vec<ParsedResult>, ParseError> {
    let root: Value = serde_json::from_slice(bytes)
        .map_err(|e| ParseError::malformed(ResultFormat::Json, e.to_string()))?;

    let rows = match &root {
        Value::Array(rows) => rows.clone(),
        Value::Object(_) => root
            .get("tests")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ParseError::malformed(ResultFormat::Json, "missing tests array"))?,
        _ => {
            return Err(ParseError::malformed(
                ResultFormat::Json,
                "expected an array or an object with a tests array",
            ))
        }
    };

    let mut results = Vec::new();
    for row in rows {
        let Some(object) = row.as_object() else {
            return Err(ParseError::malformed(
                ResultFormat::Json,
                "test entries must be objects",
            ));
        };

        let name = object
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unnamed")
            .to_string();

        let status = match object
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            Some("pass") | Some("passed") | Some("ok") => TestStatus::Pass,
            Some("fail") | Some("failed") => TestStatus::Fail,
            Some("skip") | Some("skipped") => TestStatus::Skip,
            _ => TestStatus::Error,
        };

        let mut parsed = ParsedResult::new(name, status);
        parsed.suite = object
            .get("suite")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        parsed.duration_ms = object.get("duration_ms").and_then(Value::as_u64);
        parsed.error_message = object
            .get("message")
            .or_else(|| object.get("error_message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        parsed.stack_trace = object
            .get("stack")
            .or_else(|| object.get("stack_trace"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        for (key, value) in object {
            if !KNOWN_FIELDS.contains(&key.as_str()) {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                parsed.metadata.insert(key.clone(), rendered);
            }
        }

        results.push(parsed);
    }

    Ok(results)
}
