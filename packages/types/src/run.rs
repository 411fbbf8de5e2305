use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{AgentId, Duration, RunId, ServiceId, Timestamp, Zone};

/// How a single test is executed on the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    Subprocess {
        command: String,
        args: Vec<String>,
        working_dir: Option<String>,
    },
    Container {
        image: String,
        entrypoint: Vec<String>,
        mounts: Vec<String>,
        network_mode: Option<String>,
        resource_limits: BTreeMap<String, String>,
    },
}

/// The source formats the collector knows how to normalize
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
pub enum ResultFormat {
    Junit,
    Jest,
    Playwright,
    Tap,
    Json,
    GoTest,
}

impl std::fmt::Display for ResultFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultFormat::Junit => "junit",
            ResultFormat::Jest => "jest",
            ResultFormat::Playwright => "playwright",
            ResultFormat::Tap => "tap",
            ResultFormat::Json => "json",
            ResultFormat::GoTest => "go_test",
        };
        write!(f, "{}", s)
    }
}

/// Where the agent finds results and which artifacts it should ship back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ResultConfig {
    pub result_file: Option<String>,
    pub result_format: ResultFormat,
    pub artifact_paths: Vec<String>,
}

/// One declared test within a service manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TestSpec {
    pub name: String,
    pub execution: Execution,
    pub result_config: ResultConfig,
    /// Per-test timeout; falls back to the run-level default when absent
    pub timeout: Option<Duration>,
    /// Re-executions allowed after a Fail/Error outcome
    pub retries: u32,
    /// A failing outcome does not fail the run
    pub allow_failure: bool,
    /// Names of tests within the same run that must have passed first
    pub depends_on: Vec<String>,
    /// Requires an otherwise-idle agent
    pub exclusive: bool,
    /// Sidecar services the agent must provide (postgres, redis, ...)
    pub requires_services: Vec<String>,
}

/// Credentials handed to the agent for cloning the source repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "snake_case")]
pub enum RepoCredentials {
    Token(String),
    SshKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RepoSource {
    pub clone_url: String,
    pub credentials: Option<RepoCredentials>,
}

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
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Rolled-up counters for a run. `failed` includes allow_failure tests;
/// the run status is derived from non-allowed failures only.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct RunSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// One scheduled execution of a set of test specs for a service at a revision.
///
/// Owned by at most one agent while non-terminal; the assignment lives here
/// and in the owning agent's `active_runs` as ids, never as references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: RunId,
    pub service_id: ServiceId,
    pub repo: RepoSource,
    pub git_ref: String,
    pub git_sha: String,
    pub tests: Vec<TestSpec>,
    /// Zones every candidate agent must reach
    pub zones: BTreeSet<Zone>,
    /// Higher first
    pub priority: i32,
    pub status: RunStatus,
    pub agent_id: Option<AgentId>,
    pub queued_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Absolute wall-clock bound recorded at dispatch; enforced by the reaper
    pub deadline: Option<Timestamp>,
    pub summary: RunSummary,
    /// How many times this run lost its agent and was re-queued
    pub orphan_count: u32,
    pub environment: BTreeMap<String, String>,
    pub run_timeout: Option<Duration>,
}

impl TestRun {
    /// Whether any spec in this run demands an otherwise-idle agent
    pub fn is_exclusive(&self) -> bool {
        self.tests.iter().any(|t| t.exclusive)
    }

    pub fn spec(&self, test_name: &str) -> Option<&TestSpec> {
        self.tests.iter().find(|t| t.name == test_name)
    }

    /// depends_on is resolved within this run's own test set. A name that
    /// points outside the set is a manifest error the scheduler surfaces.
    pub fn unresolved_dependencies(&self) -> Vec<&str> {
        let names: BTreeSet<&str> = self.tests.iter().map(|t| t.name.as_str()).collect();
        self.tests
            .iter()
            .flat_map(|t| t.depends_on.iter())
            .filter(|dep| !names.contains(dep.as_str()))
            .map(|dep| dep.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, depends_on: &[&str]) -> TestSpec {
        TestSpec {
            name: name.to_string(),
            execution: Execution::Subprocess {
                command: "true".to_string(),
                args: vec![],
                working_dir: None,
            },
            result_config: ResultConfig {
                result_file: None,
                result_format: ResultFormat::Json,
                artifact_paths: vec![],
            },
            timeout: None,
            retries: 0,
            allow_failure: false,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            exclusive: false,
            requires_services: vec![],
        }
    }

    fn run(tests: Vec<TestSpec>) -> TestRun {
        TestRun {
            id: RunId::new("run-1").unwrap(),
            service_id: ServiceId::new("svc-1").unwrap(),
            repo: RepoSource {
                clone_url: "https://example.com/repo.git".to_string(),
                credentials: None,
            },
            git_ref: "main".to_string(),
            git_sha: "deadbeef".to_string(),
            tests,
            zones: BTreeSet::new(),
            priority: 0,
            status: RunStatus::Pending,
            agent_id: None,
            queued_at: Timestamp::now(),
            started_at: None,
            completed_at: None,
            deadline: None,
            summary: RunSummary::default(),
            orphan_count: 0,
            environment: BTreeMap::new(),
            run_timeout: None,
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        for status in [
            RunStatus::Passed,
            RunStatus::Failed,
            RunStatus::Error,
            RunStatus::Timeout,
            RunStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn in_run_dependencies_resolve() {
        let r = run(vec![spec("build", &[]), spec("integration", &["build"])]);
        assert!(r.unresolved_dependencies().is_empty());
    }

    #[test]
    fn dangling_dependency_is_reported() {
        let r = run(vec![spec("integration", &["build"])]);
        assert_eq!(r.unresolved_dependencies(), vec!["build"]);
    }
}
