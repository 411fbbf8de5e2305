use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proctor_types::{
    Agent, AgentId, AgentState, ArtifactRef, RunId, RunStatus, RunSummary, Service, ServiceId,
    TestResult, TestRun, Timestamp, Zone,
};

use super::{RepoError, RepoResult, Repository};

/// Wraps any repository and retries transient backend blips with bounded
/// backoff. Domain errors (not-found, already-terminal, wrong-status) are
/// never retried; every method stays one logical transaction, so a retry
/// re-runs the whole operation.
pub struct RetryingRepository<R> {
    inner: Arc<R>,
    attempts: u32,
    base_delay: Duration,
}

impl<R: Repository> RetryingRepository<R> {
    pub fn new(inner: Arc<R>) -> Self {
        Self {
            inner,
            attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }

    pub fn with_policy(inner: Arc<R>, attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            base_delay,
        }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> RepoResult<T>
    where
        F: Fn(Arc<R>) -> Fut,
        Fut: std::future::Future<Output = RepoResult<T>> + Send,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match f(self.inner.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    tracing::warn!(
                        "Repository {} failed (attempt {}/{}), retrying: {}",
                        op,
                        attempt,
                        self.attempts,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<R: Repository> Repository for RetryingRepository<R> {
    async fn get_service(&self, id: &ServiceId) -> RepoResult<Option<Service>> {
        let id = id.clone();
        self.run("get_service", move |repo| {
            let id = id.clone();
            async move { repo.get_service(&id).await }
        })
        .await
    }

    async fn upsert_service(&self, service: Service) -> RepoResult<()> {
        self.run("upsert_service", move |repo| {
            let service = service.clone();
            async move { repo.upsert_service(service).await }
        })
        .await
    }

    async fn get_agent(&self, id: &AgentId) -> RepoResult<Option<Agent>> {
        let id = id.clone();
        self.run("get_agent", move |repo| {
            let id = id.clone();
            async move { repo.get_agent(&id).await }
        })
        .await
    }

    async fn upsert_agent(&self, agent: Agent) -> RepoResult<()> {
        self.run("upsert_agent", move |repo| {
            let agent = agent.clone();
            async move { repo.upsert_agent(agent).await }
        })
        .await
    }

    async fn update_heartbeat(&self, id: &AgentId, ts: Timestamp) -> RepoResult<()> {
        let id = id.clone();
        self.run("update_heartbeat", move |repo| {
            let id = id.clone();
            async move { repo.update_heartbeat(&id, ts).await }
        })
        .await
    }

    async fn list_agents(
        &self,
        zone: Option<&Zone>,
        state: Option<AgentState>,
    ) -> RepoResult<Vec<Agent>> {
        let zone = zone.cloned();
        self.run("list_agents", move |repo| {
            let zone = zone.clone();
            async move { repo.list_agents(zone.as_ref(), state).await }
        })
        .await
    }

    async fn create_run(&self, run: TestRun) -> RepoResult<()> {
        self.run("create_run", move |repo| {
            let run = run.clone();
            async move { repo.create_run(run).await }
        })
        .await
    }

    async fn get_run(&self, id: &RunId) -> RepoResult<Option<TestRun>> {
        let id = id.clone();
        self.run("get_run", move |repo| {
            let id = id.clone();
            async move { repo.get_run(&id).await }
        })
        .await
    }

    async fn mark_run_started(
        &self,
        id: &RunId,
        agent_id: &AgentId,
        started_at: Timestamp,
        deadline: Timestamp,
    ) -> RepoResult<TestRun> {
        let id = id.clone();
        let agent_id = agent_id.clone();
        self.run("mark_run_started", move |repo| {
            let id = id.clone();
            let agent_id = agent_id.clone();
            async move { repo.mark_run_started(&id, &agent_id, started_at, deadline).await }
        })
        .await
    }

    async fn requeue_run(&self, id: &RunId, orphan_count: u32) -> RepoResult<TestRun> {
        let id = id.clone();
        self.run("requeue_run", move |repo| {
            let id = id.clone();
            async move { repo.requeue_run(&id, orphan_count).await }
        })
        .await
    }

    async fn update_run_summary(&self, id: &RunId, summary: RunSummary) -> RepoResult<()> {
        let id = id.clone();
        self.run("update_run_summary", move |repo| {
            let id = id.clone();
            async move { repo.update_run_summary(&id, summary).await }
        })
        .await
    }

    async fn finalize_run(
        &self,
        id: &RunId,
        status: RunStatus,
        summary: Option<RunSummary>,
        completed_at: Timestamp,
    ) -> RepoResult<TestRun> {
        let id = id.clone();
        self.run("finalize_run", move |repo| {
            let id = id.clone();
            async move { repo.finalize_run(&id, status, summary, completed_at).await }
        })
        .await
    }

    async fn list_pending_runs(&self) -> RepoResult<Vec<TestRun>> {
        self.run("list_pending_runs", move |repo| async move {
            repo.list_pending_runs().await
        })
        .await
    }

    async fn list_running_runs(&self) -> RepoResult<Vec<TestRun>> {
        self.run("list_running_runs", move |repo| async move {
            repo.list_running_runs().await
        })
        .await
    }

    async fn append_result(&self, run_id: &RunId, result: TestResult) -> RepoResult<bool> {
        let run_id = run_id.clone();
        self.run("append_result", move |repo| {
            let run_id = run_id.clone();
            let result = result.clone();
            async move { repo.append_result(&run_id, result).await }
        })
        .await
    }

    async fn append_results(
        &self,
        run_id: &RunId,
        results: Vec<TestResult>,
    ) -> RepoResult<usize> {
        let run_id = run_id.clone();
        self.run("append_results", move |repo| {
            let run_id = run_id.clone();
            let results = results.clone();
            async move { repo.append_results(&run_id, results).await }
        })
        .await
    }

    async fn count_results(&self, run_id: &RunId) -> RepoResult<u64> {
        let run_id = run_id.clone();
        self.run("count_results", move |repo| {
            let run_id = run_id.clone();
            async move { repo.count_results(&run_id).await }
        })
        .await
    }

    async fn list_results(&self, run_id: &RunId) -> RepoResult<Vec<TestResult>> {
        let run_id = run_id.clone();
        self.run("list_results", move |repo| {
            let run_id = run_id.clone();
            async move { repo.list_results(&run_id).await }
        })
        .await
    }

    async fn insert_artifact(&self, run_id: &RunId, artifact: ArtifactRef) -> RepoResult<()> {
        let run_id = run_id.clone();
        self.run("insert_artifact", move |repo| {
            let run_id = run_id.clone();
            let artifact = artifact.clone();
            async move { repo.insert_artifact(&run_id, artifact).await }
        })
        .await
    }

    async fn list_artifacts(&self, run_id: &RunId) -> RepoResult<Vec<ArtifactRef>> {
        let run_id = run_id.clone();
        self.run("list_artifacts", move |repo| {
            let run_id = run_id.clone();
            async move { repo.list_artifacts(&run_id).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a transient error the first N times for every call
    struct FlakyRepo {
        failures_left: AtomicU32,
        inner: super::super::memory::MemoryRepository,
    }

    impl FlakyRepo {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                inner: super::super::memory::MemoryRepository::new(),
            }
        }

        fn blip(&self) -> RepoResult<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RepoError::Backend("connection reset".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Repository for FlakyRepo {
        async fn get_service(&self, id: &ServiceId) -> RepoResult<Option<Service>> {
            self.blip()?;
            self.inner.get_service(id).await
        }

        async fn upsert_service(&self, service: Service) -> RepoResult<()> {
            self.blip()?;
            self.inner.upsert_service(service).await
        }

        async fn get_agent(&self, id: &AgentId) -> RepoResult<Option<Agent>> {
            self.blip()?;
            self.inner.get_agent(id).await
        }

        async fn upsert_agent(&self, agent: Agent) -> RepoResult<()> {
            self.blip()?;
            self.inner.upsert_agent(agent).await
        }

        async fn update_heartbeat(&self, id: &AgentId, ts: Timestamp) -> RepoResult<()> {
            self.blip()?;
            self.inner.update_heartbeat(id, ts).await
        }

        async fn list_agents(
            &self,
            zone: Option<&Zone>,
            state: Option<AgentState>,
        ) -> RepoResult<Vec<Agent>> {
            self.blip()?;
            self.inner.list_agents(zone, state).await
        }

        async fn create_run(&self, run: TestRun) -> RepoResult<()> {
            self.blip()?;
            self.inner.create_run(run).await
        }

        async fn get_run(&self, id: &RunId) -> RepoResult<Option<TestRun>> {
            self.blip()?;
            self.inner.get_run(id).await
        }

        async fn mark_run_started(
            &self,
            id: &RunId,
            agent_id: &AgentId,
            started_at: Timestamp,
            deadline: Timestamp,
        ) -> RepoResult<TestRun> {
            self.blip()?;
            self.inner
                .mark_run_started(id, agent_id, started_at, deadline)
                .await
        }

        async fn requeue_run(&self, id: &RunId, orphan_count: u32) -> RepoResult<TestRun> {
            self.blip()?;
            self.inner.requeue_run(id, orphan_count).await
        }

        async fn update_run_summary(&self, id: &RunId, summary: RunSummary) -> RepoResult<()> {
            self.blip()?;
            self.inner.update_run_summary(id, summary).await
        }

        async fn finalize_run(
            &self,
            id: &RunId,
            status: RunStatus,
            summary: Option<RunSummary>,
            completed_at: Timestamp,
        ) -> RepoResult<TestRun> {
            self.blip()?;
            self.inner
                .finalize_run(id, status, summary, completed_at)
                .await
        }

        async fn list_pending_runs(&self) -> RepoResult<Vec<TestRun>> {
            self.blip()?;
            self.inner.list_pending_runs().await
        }

        async fn list_running_runs(&self) -> RepoResult<Vec<TestRun>> {
            self.blip()?;
            self.inner.list_running_runs().await
        }

        async fn append_result(&self, run_id: &RunId, result: TestResult) -> RepoResult<bool> {
            self.blip()?;
            self.inner.append_result(run_id, result).await
        }

        async fn append_results(
            &self,
            run_id: &RunId,
            results: Vec<TestResult>,
        ) -> RepoResult<usize> {
            self.blip()?;
            self.inner.append_results(run_id, results).await
        }

        async fn count_results(&self, run_id: &RunId) -> RepoResult<u64> {
            self.blip()?;
            self.inner.count_results(run_id).await
        }

        async fn list_results(&self, run_id: &RunId) -> RepoResult<Vec<TestResult>> {
            self.blip()?;
            self.inner.list_results(run_id).await
        }

        async fn insert_artifact(&self, run_id: &RunId, artifact: ArtifactRef) -> RepoResult<()> {
            self.blip()?;
            self.inner.insert_artifact(run_id, artifact).await
        }

        async fn list_artifacts(&self, run_id: &RunId) -> RepoResult<Vec<ArtifactRef>> {
            self.blip()?;
            self.inner.list_artifacts(run_id).await
        }
    }

    #[tokio::test]
    async fn transient_blips_are_absorbed() {
        let repo = RetryingRepository::with_policy(
            Arc::new(FlakyRepo::new(2)),
            3,
            Duration::from_millis(1),
        );
        let missing = repo
            .get_run(&RunId::new("run-1").unwrap())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn persistent_failure_surfaces() {
        let repo = RetryingRepository::with_policy(
            Arc::new(FlakyRepo::new(100)),
            3,
            Duration::from_millis(1),
        );
        let err = repo
            .get_run(&RunId::new("run-1").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn domain_errors_are_not_retried() {
        let flaky = Arc::new(FlakyRepo::new(0));
        let repo = RetryingRepository::with_policy(flaky, 3, Duration::from_millis(1));
        // finalizing an unknown run is a domain error, surfaced immediately
        let err = repo
            .finalize_run(
                &RunId::new("run-1").unwrap(),
                RunStatus::Passed,
                None,
                Timestamp::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::NotFound { .. }));
    }
}
