//! Playwright JSON reporter: nested `suites` trees whose `specs` carry
//! `tests`, each with one result per retry. We emit the last result of
//! each test; earlier retries are the agent's business.

use proctor_types::{ResultFormat, TestStatus};
use serde_json::Value;

use super::{ParseError, ParsedResult};

pub fn parse(bytes: &[u8]) -> Result<Vec<ParsedResult>, ParseError> {
    let root: Value = serde_json::from_slice(bytes)
        .map_err(|e| ParseError::malformed(ResultFormat::Playwright, e.to_string()))?;

    let suites = root
        .get("suites")
        .and_then(Value::as_array)
        .ok_or_else(|| ParseError::malformed(ResultFormat::Playwright, "missing suites"))?;

    let mut results = Vec::new();
    for suite in suites {
        walk_suite(suite, None, &mut results);
    }
    Ok(results)
}

fn walk_suite(suite: &Value, parent: Option<&str>, out: &mut Vec<ParsedResult>) {
    let title = suite.get("title").and_then(Value::as_str).unwrap_or("");
    let full_title = match parent {
        Some(parent) if !title.is_empty() => format!("{} > {}", parent, title),
        Some(parent) => parent.to_string(),
        None => title.to_string(),
    };
    let suite_name = if full_title.is_empty() {
        None
    } else {
        Some(full_title.as_str())
    };

    if let Some(specs) = suite.get("specs").and_then(Value::as_array) {
        for spec in specs {
            let spec_title = spec
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("unnamed");

            for test in spec
                .get("tests")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let Some(result) = test
                    .get("results")
                    .and_then(Value::as_array)
                    .and_then(|r| r.last())
                else {
                    continue;
                };

                let status = match result.get("status").and_then(Value::as_str) {
                    Some("passed") => TestStatus::Pass,
                    Some("failed") => TestStatus::Fail,
                    Some("timedOut") | Some("interrupted") => TestStatus::Error,
                    Some("skipped") => TestStatus::Skip,
                    _ => TestStatus::Error,
                };

                let mut row = ParsedResult::new(spec_title, status);
                row.suite = suite_name.map(|s| s.to_string());
                row.duration_ms = result
                    .get("duration")
                    .and_then(Value::as_f64)
                    .map(|ms| ms.round().max(0.0) as u64);
                if let Some(error) = result.get("error") {
                    row.error_message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string());
                    row.stack_trace = error
                        .get("stack")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string());
                }
                if let Some(project) = test.get("projectName").and_then(Value::as_str) {
                    row.metadata
                        .insert("project".to_string(), project.to_string());
                }
                out.push(row);
            }
        }
    }

    if let Some(children) = suite.get("suites").and_then(Value::as_array) {
        for child in children {
            walk_suite(child, suite_name, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "suites": [
            {
                "title": "checkout.spec.ts",
                "specs": [],
                "suites": [
                    {
                        "title": "checkout",
                        "specs": [
                            {
                                "title": "pays with card",
                                "tests": [
                                    {"projectName": "chromium", "results": [
                                        {"status": "failed", "duration": 900, "error": {"message": "card declined", "stack": "at checkout.spec.ts:10"}},
                                        {"status": "passed", "duration": 850.4}
                                    ]}
                                ]
                            },
                            {
                                "title": "shows receipt",
                                "tests": [
                                    {"projectName": "chromium", "results": [{"status": "timedOut", "duration": 30000}]}
                                ]
                            }
                        ]
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn parses_nested_suites_last_result_wins() {
        let results = parse(REPORT.as_bytes()).unwrap();
        assert_eq!(results.len(), 2);

        assert_eq!(results[0].name, "pays with card");
        assert_eq!(results[0].status, TestStatus::Pass);
        assert_eq!(results[0].duration_ms, Some(850));
        assert_eq!(
            results[0].suite.as_deref(),
            Some("checkout.spec.ts > checkout")
        );
        assert_eq!(results[0].metadata.get("project").unwrap(), "chromium");

        assert_eq!(results[1].status, TestStatus::Error);
    }
}
