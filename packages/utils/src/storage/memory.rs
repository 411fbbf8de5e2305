use std::collections::BTreeMap;

use async_trait::async_trait;
use proctor_types::{
    Agent, AgentId, AgentState, ArtifactRef, RunId, RunStatus, RunSummary, Service, ServiceId,
    TestResult, TestRun, Timestamp, Zone,
};
use tokio::sync::Mutex;

use super::{RepoError, RepoResult, Repository};

/// The in-memory repository used by the minimal deployment and every test.
///
/// One mutex over all tables is the transaction boundary: a method holds
/// the lock for its whole mutation, so partial writes are impossible.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    services: BTreeMap<ServiceId, Service>,
    agents: BTreeMap<AgentId, Agent>,
    runs: BTreeMap<RunId, TestRun>,
    // (test name, attempt) -> row
    results: BTreeMap<RunId, BTreeMap<(String, u32), TestResult>>,
    artifacts: BTreeMap<RunId, Vec<ArtifactRef>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn run_mut(&mut self, id: &RunId) -> RepoResult<&mut TestRun> {
        self.runs
            .get_mut(id)
            .ok_or_else(|| RepoError::not_found("run", id))
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_service(&self, id: &ServiceId) -> RepoResult<Option<Service>> {
        Ok(self.inner.lock().await.services.get(id).cloned())
    }

    async fn upsert_service(&self, service: Service) -> RepoResult<()> {
        self.inner
            .lock()
            .await
            .services
            .insert(service.id.clone(), service);
        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> RepoResult<Option<Agent>> {
        Ok(self.inner.lock().await.agents.get(id).cloned())
    }

    async fn upsert_agent(&self, agent: Agent) -> RepoResult<()> {
        self.inner.lock().await.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn update_heartbeat(&self, id: &AgentId, ts: Timestamp) -> RepoResult<()> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .agents
            .get_mut(id)
            .ok_or_else(|| RepoError::not_found("agent", id))?;
        agent.last_heartbeat = ts;
        Ok(())
    }

    async fn list_agents(
        &self,
        zone: Option<&Zone>,
        state: Option<AgentState>,
    ) -> RepoResult<Vec<Agent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .agents
            .values()
            .filter(|a| zone.is_none_or(|z| a.caps.zones.contains(z)))
            .filter(|a| state.is_none_or(|s| a.state == s))
            .cloned()
            .collect())
    }

    async fn create_run(&self, run: TestRun) -> RepoResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.runs.contains_key(&run.id) {
            return Err(RepoError::AlreadyExists(run.id.to_string()));
        }
        inner.runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> RepoResult<Option<TestRun>> {
        Ok(self.inner.lock().await.runs.get(id).cloned())
    }

    async fn mark_run_started(
        &self,
        id: &RunId,
        agent_id: &AgentId,
        started_at: Timestamp,
        deadline: Timestamp,
    ) -> RepoResult<TestRun> {
        let mut inner = self.inner.lock().await;
        let run = inner.run_mut(id)?;
        if run.status != RunStatus::Pending {
            return Err(RepoError::WrongStatus {
                run_id: id.clone(),
                expected: RunStatus::Pending,
            });
        }
        run.status = RunStatus::Running;
        run.agent_id = Some(agent_id.clone());
        run.started_at = Some(started_at);
        run.deadline = Some(deadline);
        Ok(run.clone())
    }

    async fn requeue_run(&self, id: &RunId, orphan_count: u32) -> RepoResult<TestRun> {
        let mut inner = self.inner.lock().await;
        let run = inner.run_mut(id)?;
        if run.status.is_terminal() {
            return Err(RepoError::AlreadyTerminal {
                run_id: id.clone(),
                status: run.status,
            });
        }
        run.status = RunStatus::Pending;
        run.agent_id = None;
        run.started_at = None;
        run.deadline = None;
        run.orphan_count = orphan_count;
        Ok(run.clone())
    }

    async fn update_run_summary(&self, id: &RunId, summary: RunSummary) -> RepoResult<()> {
        let mut inner = self.inner.lock().await;
        let run = inner.run_mut(id)?;
        if !run.status.is_terminal() {
            run.summary = summary;
        }
        Ok(())
    }

    async fn finalize_run(
        &self,
        id: &RunId,
        status: RunStatus,
        summary: Option<RunSummary>,
        completed_at: Timestamp,
    ) -> RepoResult<TestRun> {
        let mut inner = self.inner.lock().await;
        let run = inner.run_mut(id)?;
        if run.status.is_terminal() {
            return Err(RepoError::AlreadyTerminal {
                run_id: id.clone(),
                status: run.status,
            });
        }
        run.status = status;
        if let Some(summary) = summary {
            run.summary = summary;
        }
        run.completed_at = Some(completed_at);
        Ok(run.clone())
    }

    async fn list_pending_runs(&self) -> RepoResult<Vec<TestRun>> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<TestRun> = inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.queued_at.cmp(&b.queued_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(pending)
    }

    async fn list_running_runs(&self) -> RepoResult<Vec<TestRun>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .cloned()
            .collect())
    }

    async fn append_result(&self, run_id: &RunId, result: TestResult) -> RepoResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.runs.contains_key(run_id) {
            return Err(RepoError::not_found("run", run_id));
        }
        let rows = inner.results.entry(run_id.clone()).or_default();
        let key = (result.name.clone(), result.attempt);
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, result);
        Ok(true)
    }

    async fn append_results(
        &self,
        run_id: &RunId,
        results: Vec<TestResult>,
    ) -> RepoResult<usize> {
        let mut inner = self.inner.lock().await;
        if !inner.runs.contains_key(run_id) {
            return Err(RepoError::not_found("run", run_id));
        }
        let rows = inner.results.entry(run_id.clone()).or_default();
        let mut inserted = 0;
        for result in results {
            let key = (result.name.clone(), result.attempt);
            if let std::collections::btree_map::Entry::Vacant(entry) = rows.entry(key) {
                entry.insert(result);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn count_results(&self, run_id: &RunId) -> RepoResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .results
            .get(run_id)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn list_results(&self, run_id: &RunId) -> RepoResult<Vec<TestResult>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .results
            .get(run_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_artifact(&self, run_id: &RunId, artifact: ArtifactRef) -> RepoResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.runs.contains_key(run_id) {
            return Err(RepoError::not_found("run", run_id));
        }
        inner.artifacts.entry(run_id.clone()).or_default().push(artifact);
        Ok(())
    }

    async fn list_artifacts(&self, run_id: &RunId) -> RepoResult<Vec<ArtifactRef>> {
        let inner = self.inner.lock().await;
        Ok(inner.artifacts.get(run_id).cloned().unwrap_or_default())
    }
}
