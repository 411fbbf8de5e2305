//! Result-format normalization. Each parser is a pure function from raw
//! bytes to normalized rows; adding a format means adding an arm to
//! [`parse`] and a module next to the others.

mod gotest;
mod jest;
mod json;
mod junit;
mod playwright;
mod tap;

use std::collections::BTreeMap;

use proctor_types::{ResultFormat, TestResult, TestStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed {format} payload: {message}")]
    Malformed {
        format: ResultFormat,
        message: String,
    },

    #[error("payload is not valid utf-8")]
    NotUtf8,
}

impl ParseError {
    fn malformed(format: ResultFormat, message: impl Into<String>) -> Self {
        ParseError::Malformed {
            format,
            message: message.into(),
        }
    }
}

/// A normalized row before the collector stamps the attempt number.
/// Fields with no slot in the source format stay `None`; source fields
/// with no normalized slot are preserved in `metadata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResult {
    pub name: String,
    pub suite: Option<String>,
    pub status: TestStatus,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ParsedResult {
    pub fn new(name: impl Into<String>, status: TestStatus) -> Self {
        Self {
            name: name.into(),
            suite: None,
            status,
            duration_ms: None,
            error_message: None,
            stack_trace: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn into_test_result(self, attempt: u32) -> TestResult {
        TestResult {
            name: self.name,
            suite: self.suite,
            status: self.status,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            stack_trace: self.stack_trace,
            metadata: self.metadata,
            attempt,
        }
    }
}

pub fn parse(format: ResultFormat, bytes: &[u8]) -> Result<Vec<ParsedResult>, ParseError> {
    match format {
        ResultFormat::Junit => junit::parse(bytes),
        ResultFormat::Jest => jest::parse(bytes),
        ResultFormat::Playwright => playwright::parse(bytes),
        ResultFormat::Tap => tap::parse(bytes),
        ResultFormat::Json => json::parse(bytes),
        ResultFormat::GoTest => gotest::parse(bytes),
    }
}

/// Seconds (possibly fractional) to whole milliseconds
fn secs_to_ms(secs: f64) -> u64 {
    (secs * 1000.0).round().max(0.0) as u64
}
