//! `go test -json`: newline-delimited events. Output lines accumulate per
//! test so failures carry their log; pass/fail/skip events close a test.

use std::collections::BTreeMap;

use proctor_types::{ResultFormat, TestStatus};
use serde_json::Value;

use super::{secs_to_ms, ParseError, ParsedResult};

pub fn parse(bytes: &[u8]) -> Result<Vec<ParsedResult>, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ParseError::NotUtf8)?;

    let mut output: BTreeMap<String, String> = BTreeMap::new();
    let mut results = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: Value = serde_json::from_str(line).map_err(|e| {
            ParseError::malformed(ResultFormat::GoTest, format!("line {}: {}", lineno + 1, e))
        })?;

        // package-level events carry no Test field
        let Some(test) = event.get("Test").and_then(Value::as_str) else {
            continue;
        };
        let action = event.get("Action").and_then(Value::as_str).unwrap_or("");

        match action {
            "output" => {
                if let Some(chunk) = event.get("Output").and_then(Value::as_str) {
                    output.entry(test.to_string()).or_default().push_str(chunk);
                }
            }
            "pass" | "fail" | "skip" => {
                let status = match action {
                    "pass" => TestStatus::Pass,
                    "fail" => TestStatus::Fail,
                    _ => TestStatus::Skip,
                };
                let mut row = ParsedResult::new(test, status);
                row.suite = event
                    .get("Package")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string());
                row.duration_ms = event
                    .get("Elapsed")
                    .and_then(Value::as_f64)
                    .map(secs_to_ms);
                if status == TestStatus::Fail {
                    let logged = output.remove(test).unwrap_or_default();
                    if !logged.trim().is_empty() {
                        row.error_message = Some(logged.trim().to_string());
                    }
                } else {
                    output.remove(test);
                }
                results.push(row);
            }
            _ => {}
        }
    }

    Ok(results)
}
