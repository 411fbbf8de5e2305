use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    Error,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Skip => "skip",
            TestStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// The normalized per-test record every source format is parsed into.
/// Natural key within a run: `(name, attempt)` — duplicate deliveries
/// across reconnects collapse onto one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TestResult {
    pub name: String,
    pub suite: Option<String>,
    pub status: TestStatus,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    /// Source-format fields with no normalized slot are preserved here
    pub metadata: BTreeMap<String, String>,
    /// 1-based; bumped on each retry of the same test
    pub attempt: u32,
}

impl TestResult {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            suite: None,
            status: TestStatus::Pass,
            duration_ms: None,
            error_message: None,
            stack_trace: None,
            metadata: BTreeMap::new(),
            attempt: 1,
        }
    }

    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            suite: None,
            status: TestStatus::Fail,
            duration_ms: None,
            error_message: Some(message.into()),
            stack_trace: None,
            metadata: BTreeMap::new(),
            attempt: 1,
        }
    }
}

/// A pointer at externally-stored artifact bytes. The core never holds
/// the bytes themselves past the inline-upload threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub storage_key: String,
    pub content_type: String,
    pub size: u64,
    /// Set when the artifact belongs to a single test rather than the run
    pub test_name: Option<String>,
}
