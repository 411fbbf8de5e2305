//! The agent wire protocol: tagged unions carried in length-prefixed
//! bincode frames over the agent-initiated TLS stream.
//!
//! Timestamps cross the wire as epoch millis so frames stay plain data;
//! domain code converts to [`crate::Timestamp`] at the boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AgentCaps, AgentId, DrainId, RepoSource, RunId, RunSummary, TestResult, TestSpec};

/// Version the core speaks. Agents must register with a semver-compatible
/// `protocol_version` or the session is refused before any registry touch.
pub const PROTOCOL_VERSION: &str = "1.2.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "snake_case")]
pub enum Credential {
    Token(String),
    /// Identity was established by the TLS layer (client certificate)
    Mtls,
    /// A signed machine-identity assertion validated by the configured issuer
    Oidc(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RegisterRequest {
    /// Absent or unknown ids get a freshly minted one back
    pub agent_id: Option<AgentId>,
    pub name: String,
    pub version: String,
    pub caps: AgentCaps,
    pub protocol_version: String,
    pub credential: Credential,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum ReportedState {
    Idle,
    Busy,
    Draining,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Heartbeat {
    pub agent_id: AgentId,
    pub ts_ms: u64,
    pub reported_state: ReportedState,
    pub active_runs: Vec<RunId>,
    pub usage: ResourceUsage,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactBytes {
    /// Small payloads travel on the session; the collector uploads them
    Inline(Vec<u8>),
    /// The agent already uploaded via a presigned url; this is the key
    UploadRef(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ArtifactPayload {
    pub name: String,
    pub content_type: String,
    pub bytes: ArtifactBytes,
    pub test_name: Option<String>,
}

/// Terminal outcome as the agent saw it
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "snake_case")]
pub enum ResultPayload {
    LogChunk {
        stream: LogStream,
        bytes: Vec<u8>,
        ts_ms: u64,
    },
    TestResult(TestResult),
    Artifact(ArtifactPayload),
    RunComplete {
        outcome: RunOutcome,
        summary: RunSummary,
        completed_at_ms: u64,
    },
}

/// Agent -> core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "snake_case")]
pub enum AgentMessage {
    Register(RegisterRequest),
    Heartbeat(Heartbeat),
    WorkAccepted {
        run_id: RunId,
        accepted_at_ms: u64,
    },
    WorkRejected {
        run_id: RunId,
        reason: String,
    },
    Result {
        run_id: RunId,
        payload: ResultPayload,
    },
    DrainComplete {
        drain_id: DrainId,
    },
}

/// Operational parameters handed back at registration
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct AgentConfig {
    pub heartbeat_interval_s: u64,
    pub default_timeout_s: u64,
    pub max_artifact_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AssignWork {
    pub run_id: RunId,
    pub priority: i32,
    pub repo: RepoSource,
    pub git_ref: String,
    pub git_sha: String,
    pub tests: Vec<TestSpec>,
    pub environment: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub timeout_s: u64,
    /// 1 for the initial dispatch; >1 when the collector re-submits a
    /// single failing test on the same session
    pub attempt: u32,
}

/// Core -> agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "snake_case")]
pub enum CoreMessage {
    RegisterResponse {
        agent_id: AgentId,
        config: AgentConfig,
    },
    AssignWork(AssignWork),
    CancelWork {
        run_id: RunId,
        reason: String,
    },
    Drain {
        drain_id: DrainId,
    },
}

impl From<RunOutcome> for crate::RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Success => crate::RunStatus::Passed,
            RunOutcome::Failed => crate::RunStatus::Failed,
            RunOutcome::Error => crate::RunStatus::Error,
            RunOutcome::Cancelled => crate::RunStatus::Cancelled,
        }
    }
}

/// Compatibility gate for incoming registrations: same major, and for the
/// 0.x line same minor, as [`PROTOCOL_VERSION`].
pub fn protocol_compatible(agent_version: &str) -> bool {
    let ours: semver::Version = PROTOCOL_VERSION.parse().expect("own version is valid");
    let theirs: semver::Version = match agent_version.parse() {
        Ok(v) => v,
        Err(_) => return false,
    };

    if ours.major == 0 {
        theirs.major == 0 && theirs.minor == ours.minor
    } else {
        theirs.major == ours.major
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_version_gate() {
        assert!(protocol_compatible(PROTOCOL_VERSION));
        assert!(protocol_compatible("1.0.3"));
        assert!(!protocol_compatible("2.0.0"));
        assert!(!protocol_compatible("not-a-version"));
    }

    #[test]
    fn outcome_maps_to_status() {
        use crate::RunStatus;
        assert_eq!(RunStatus::from(RunOutcome::Success), RunStatus::Passed);
        assert_eq!(RunStatus::from(RunOutcome::Cancelled), RunStatus::Cancelled);
    }

    #[test]
    fn wire_round_trip() {
        let msg = AgentMessage::WorkAccepted {
            run_id: RunId::new("run-7").unwrap(),
            accepted_at_ms: 1_700_000_000_000,
        };
        let bytes = bincode::encode_to_vec(&msg, bincode::config::standard()).unwrap();
        let (back, _): (AgentMessage, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(msg, back);
    }
}
