pub mod memory;
pub mod retry;

use async_trait::async_trait;
use proctor_types::{
    Agent, AgentState, ArtifactRef, RunId, RunStatus, RunSummary, Service, ServiceId, TestResult,
    TestRun, Timestamp, Zone,
};
use thiserror::Error;

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("run {run_id} is already terminal ({status})")]
    AlreadyTerminal { run_id: RunId, status: RunStatus },

    #[error("run {run_id} is not {expected}")]
    WrongStatus { run_id: RunId, expected: RunStatus },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("storage backend: {0}")]
    Backend(String),
}

impl RepoError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        RepoError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Transient backend blips are the only variant worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::Backend(_))
    }
}

/// Transactional access to services, runs, results, artifacts, and agents.
///
/// Every method is one logical transaction: it either fully applies or
/// leaves the store untouched. The core never sees SQL (or whatever the
/// backend speaks) — only these operations.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    // services
    async fn get_service(&self, id: &ServiceId) -> RepoResult<Option<Service>>;
    async fn upsert_service(&self, service: Service) -> RepoResult<()>;

    // agents
    async fn get_agent(&self, id: &proctor_types::AgentId) -> RepoResult<Option<Agent>>;
    async fn upsert_agent(&self, agent: Agent) -> RepoResult<()>;
    async fn update_heartbeat(
        &self,
        id: &proctor_types::AgentId,
        ts: Timestamp,
    ) -> RepoResult<()>;
    async fn list_agents(
        &self,
        zone: Option<&Zone>,
        state: Option<AgentState>,
    ) -> RepoResult<Vec<Agent>>;

    // runs
    async fn create_run(&self, run: TestRun) -> RepoResult<()>;
    async fn get_run(&self, id: &RunId) -> RepoResult<Option<TestRun>>;
    /// Pending -> Running with agent, start time and deadline, atomically
    async fn mark_run_started(
        &self,
        id: &RunId,
        agent_id: &proctor_types::AgentId,
        started_at: Timestamp,
        deadline: Timestamp,
    ) -> RepoResult<TestRun>;
    /// Back to Pending after an orphaned dispatch; clears the assignment
    async fn requeue_run(&self, id: &RunId, orphan_count: u32) -> RepoResult<TestRun>;
    /// Progressive summary updates while the run streams results
    async fn update_run_summary(&self, id: &RunId, summary: RunSummary) -> RepoResult<()>;
    /// Terminal transition: status + final summary + completion time in one
    /// transaction. Fails with [`RepoError::AlreadyTerminal`] on a second
    /// finalize so terminal status is first-wins.
    async fn finalize_run(
        &self,
        id: &RunId,
        status: RunStatus,
        summary: Option<RunSummary>,
        completed_at: Timestamp,
    ) -> RepoResult<TestRun>;
    /// Ordered (priority desc, queued_at asc)
    async fn list_pending_runs(&self) -> RepoResult<Vec<TestRun>>;
    async fn list_running_runs(&self) -> RepoResult<Vec<TestRun>>;

    // results
    /// Returns false when `(run, name, attempt)` was already persisted
    async fn append_result(&self, run_id: &RunId, result: TestResult) -> RepoResult<bool>;
    async fn append_results(&self, run_id: &RunId, results: Vec<TestResult>)
        -> RepoResult<usize>;
    async fn count_results(&self, run_id: &RunId) -> RepoResult<u64>;
    async fn list_results(&self, run_id: &RunId) -> RepoResult<Vec<TestResult>>;

    // artifacts
    async fn insert_artifact(&self, run_id: &RunId, artifact: ArtifactRef) -> RepoResult<()>;
    async fn list_artifacts(&self, run_id: &RunId) -> RepoResult<Vec<ArtifactRef>>;
}
