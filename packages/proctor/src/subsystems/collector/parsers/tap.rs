//! TAP (Test Anything Protocol), version 13-ish: `ok`/`not ok` lines with
//! optional `# SKIP`/`# TODO` directives. Plan and diagnostic lines are
//! ignored; nothing in TAP carries durations.

use proctor_types::TestStatus;

use super::{ParseError, ParsedResult};

pub fn parse(bytes: &[u8]) -> Result<Vec<ParsedResult>, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ParseError::NotUtf8)?;

    let mut results = Vec::new();
    for line in text.lines() {
        let line = line.trim();

        let (ok, rest) = if let Some(rest) = line.strip_prefix("not ok") {
            (false, rest)
        } else if let Some(rest) = line.strip_prefix("ok") {
            (true, rest)
        } else {
            // version, plan, diagnostics, bail out — all ignored
            continue;
        };

        // "<number> - <description> # <directive>"
        let (body, directive) = match rest.split_once('#') {
            Some((body, directive)) => (body, Some(directive.trim())),
            None => (rest, None),
        };

        let mut name = body.trim();
        // strip the optional test number
        if let Some(stripped) = name
            .split_once(' ')
            .filter(|(number, _)| number.chars().all(|c| c.is_ascii_digit()))
            .map(|(_, rest)| rest)
        {
            name = stripped;
        } else if name.chars().all(|c| c.is_ascii_digit()) {
            name = "";
        }
        let name = name.trim_start_matches('-').trim();
        let name = if name.is_empty() { "unnamed" } else { name };

        let skip = directive
            .map(|d| {
                let lower = d.to_ascii_lowercase();
                lower.starts_with("skip") || lower.starts_with("todo")
            })
            .unwrap_or(false);

        let status = if skip {
            TestStatus::Skip
        } else if ok {
            TestStatus::Pass
        } else {
            TestStatus::Fail
        };

        let mut row = ParsedResult::new(name, status);
        if let Some(directive) = directive {
            row.metadata
                .insert("directive".to_string(), directive.to_string());
        }
        results.push(row);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "TAP version 13\n\
1..4\n\
ok 1 - connects to the broker\n\
not ok 2 - reconnects after a drop\n\
# a diagnostic line\n\
ok 3 - flushes the queue # SKIP broker pinned\n\
not ok 4 - replays messages # TODO known flake\n";

    #[test]
    fn parses_tap_lines() {
        let results = parse(REPORT.as_bytes()).unwrap();
        assert_eq!(results.len(), 4);

        assert_eq!(results[0].name, "connects to the broker");
        assert_eq!(results[0].status, TestStatus::Pass);

        assert_eq!(results[1].name, "reconnects after a drop");
        assert_eq!(results[1].status, TestStatus::Fail);

        assert_eq!(results[2].status, TestStatus::Skip);
        assert_eq!(
            results[2].metadata.get("directive").unwrap(),
            "SKIP broker pinned"
        );

        // TODO directives are skips, not failures
        assert_eq!(results[3].status, TestStatus::Skip);
    }

    #[test]
    fn numberless_lines_still_parse() {
        let results = parse(b"ok - just works\n").unwrap();
        assert_eq!(results[0].name, "just works");
    }
}
