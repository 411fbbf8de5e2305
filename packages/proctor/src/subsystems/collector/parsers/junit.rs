//! JUnit XML: `<testsuite>` elements containing `<testcase>` elements,
//! with `<failure>`, `<error>` or `<skipped>` children marking non-pass
//! outcomes. Produced by practically every JVM tool and by pytest.

use proctor_types::{ResultFormat, TestStatus};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{secs_to_ms, ParseError, ParsedResult};

#[derive(Default)]
struct ParserState {
    results: Vec<ParsedResult>,
    suite: Option<String>,
    current: Option<ParsedResult>,
    // set while inside a <failure>/<error>/<skipped> element
    capturing_text: bool,
}

pub fn parse(bytes: &[u8]) -> Result<Vec<ParsedResult>, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut state = ParserState::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Err(e) => return Err(ParseError::malformed(ResultFormat::Junit, e.to_string())),

            Ok(Event::Start(e)) => handle_open(&mut state, &e, false)?,
            Ok(Event::Empty(e)) => handle_open(&mut state, &e, true)?,

            Ok(Event::Text(t)) => {
                if state.capturing_text {
                    if let Some(row) = state.current.as_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| ParseError::malformed(ResultFormat::Junit, e.to_string()))?;
                        if !text.trim().is_empty() {
                            row.stack_trace = Some(text.trim().to_string());
                        }
                    }
                }
            }

            Ok(Event::End(e)) => match e.name().as_ref() {
                b"testcase" => {
                    if let Some(row) = state.current.take() {
                        state.results.push(row);
                    }
                }
                b"failure" | b"error" | b"skipped" => {
                    state.capturing_text = false;
                }
                b"testsuite" => {
                    state.suite = None;
                }
                _ => {}
            },

            Ok(Event::Eof) => break,
            Ok(_) => {}
        }
        buf.clear();
    }

    Ok(state.results)
}

fn handle_open(
    state: &mut ParserState,
    e: &BytesStart<'_>,
    empty: bool,
) -> Result<(), ParseError> {
    match e.name().as_ref() {
        b"testsuite" => {
            state.suite = attr(e, b"name");
        }
        b"testcase" => {
            let name = attr(e, b"name").unwrap_or_else(|| "unnamed".to_string());
            let mut row = ParsedResult::new(name, TestStatus::Pass);
            row.suite = attr(e, b"classname").or_else(|| state.suite.clone());
            row.duration_ms = attr(e, b"time")
                .and_then(|t| t.parse::<f64>().ok())
                .map(secs_to_ms);
            if empty {
                state.results.push(row);
            } else {
                state.current = Some(row);
            }
        }
        b"failure" | b"error" | b"skipped" => {
            if let Some(row) = state.current.as_mut() {
                row.status = match e.name().as_ref() {
                    b"failure" => TestStatus::Fail,
                    b"error" => TestStatus::Error,
                    _ => TestStatus::Skip,
                };
                row.error_message = attr(e, b"message");
                if let Some(kind) = attr(e, b"type") {
                    row.metadata.insert("type".to_string(), kind);
                }
                state.capturing_text = !empty;
            }
        }
        _ => {}
    }
    Ok(())
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}
