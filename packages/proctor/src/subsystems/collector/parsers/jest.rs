//! Jest `--json` output: a root object with `testResults` per file, each
//! carrying `assertionResults`.

use proctor_types::{ResultFormat, TestStatus};
use serde_json::Value;

use super::{ParseError, ParsedResult};

pub fn parse(bytes: &[u8]) -> Result<Vec<ParsedResult>, ParseError> {
    let root: Value = serde_json::from_slice(bytes)
        .map_err(|e| ParseError::malformed(ResultFormat::Jest, e.to_string()))?;

    let files = root
        .get("testResults")
        .and_then(Value::as_array)
        .ok_or_else(|| ParseError::malformed(ResultFormat::Jest, "missing testResults"))?;

    let mut results = Vec::new();
    for file in files {
        let suite = file
            .get("name")
            .or_else(|| file.get("testFilePath"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        let assertions = file
            .get("assertionResults")
            .or_else(|| file.get("testResults"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for assertion in assertions {
            let name = assertion
                .get("fullName")
                .or_else(|| assertion.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("unnamed")
                .to_string();

            let status = match assertion.get("status").and_then(Value::as_str) {
                Some("passed") => TestStatus::Pass,
                Some("failed") => TestStatus::Fail,
                Some("skipped") | Some("pending") | Some("todo") | Some("disabled") => {
                    TestStatus::Skip
                }
                other => {
                    let mut row = ParsedResult::new(name, TestStatus::Error);
                    if let Some(other) = other {
                        row.metadata
                            .insert("status".to_string(), other.to_string());
                    }
                    row.suite = suite.clone();
                    results.push(row);
                    continue;
                }
            };

            let mut row = ParsedResult::new(name, status);
            row.suite = suite.clone();
            row.duration_ms = assertion
                .get("duration")
                .and_then(Value::as_f64)
                .map(|ms| ms.round().max(0.0) as u64);

            if let Some(messages) = assertion.get("failureMessages").and_then(Value::as_array) {
                let joined: Vec<&str> = messages.iter().filter_map(Value::as_str).collect();
                if !joined.is_empty() {
                    row.error_message = Some(joined.join("\n"));
                }
            }

            results.push(row);
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "numTotalTests": 3,
        "testResults": [
            {
                "name": "/repo/src/cart.test.ts",
                "assertionResults": [
                    {"title": "adds items", "fullName": "cart adds items", "status": "passed", "duration": 12.6},
                    {"title": "rejects negatives", "fullName": "cart rejects negatives", "status": "failed",
                     "failureMessages": ["expected -1 to be >= 0"]},
                    {"title": "legacy flow", "fullName": "cart legacy flow", "status": "todo"}
                ]
            }
        ]
    }"#;

    #[test]
    fn parses_jest_json() {
        let results = parse(REPORT.as_bytes()).unwrap();
        assert_eq!(results.len(), 3);

        assert_eq!(results[0].name, "cart adds items");
        assert_eq!(results[0].status, TestStatus::Pass);
        assert_eq!(results[0].duration_ms, Some(13));
        assert_eq!(results[0].suite.as_deref(), Some("/repo/src/cart.test.ts"));

        assert_eq!(results[1].status, TestStatus::Fail);
        assert_eq!(
            results[1].error_message.as_deref(),
            Some("expected -1 to be >= 0")
        );

        assert_eq!(results[2].status, TestStatus::Skip);
    }

    #[test]
    fn missing_test_results_is_malformed() {
        assert!(parse(br#"{"numTotalTests": 0}"#).is_err());
    }
}
