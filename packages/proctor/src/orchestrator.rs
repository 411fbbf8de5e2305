/***
 *
 * High-level system design
 *
 * The Orchestrator is the composition root of the control plane. It owns
 * the five subsystems and the channels between them:
 *
 * * The SessionManager/SessionRouter own one bidirectional stream per
 *   connected agent (agents dial out to us; we never dial in).
 * * The AgentRegistry is the authoritative map of agent identity, state
 *   and load; every capacity decision goes through its critical section.
 * * The Scheduler turns pending runs into per-agent assignments and feeds
 *   AssignWork/CancelWork messages into the sessions.
 * * The ResultCollector consumes the streamed result protocol, persists
 *   normalized rows progressively, and finalizes runs.
 * * The LivenessReaper turns missed heartbeats into offline agents and
 *   orphaned runs into requeues or failures, and enforces run deadlines.
 *
 * Dataflow (triggers enter from outside, results leave to the sinks):
 *
 *   webhook/cron/api -> submit_run -> Scheduler -> Session -> agent
 *   agent -> Session -> {Registry, Scheduler, Collector} -> Repository
 *                                              Collector -> NotificationSink
 *
 * Runs reference agents by id only and agents hold run ids only; the
 * repository is the single place that materializes the relation.
 *
 ***/

use std::sync::Arc;

use proctor_types::{
    Agent, AgentId, DrainId, RunId, RunStatus, ServiceId, TestRun, Timestamp,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::instrument;
use utils::context::AppContext;
use utils::storage::{RepoError, Repository};
use utils::telemetry::CoreMetrics;

use crate::artifacts::ArtifactStore;
use crate::catalog::{CatalogError, TestCatalog};
use crate::config::Config;
use crate::notify::NotificationSink;
use crate::subsystems::collector::{CollectorHandle, LogFanout, ResultCollector};
use crate::subsystems::reaper::LivenessReaper;
use crate::subsystems::registry::{AgentRegistry, RegistryError};
use crate::subsystems::scheduler::{Scheduler, SchedulerCommand};
use crate::subsystems::session::auth::Authenticator;
use crate::subsystems::session::{CloseCause, SessionError, SessionManager, SessionRouter};

/// The external collaborators the core consumes, injected at startup.
/// The minimal single-process deployment wires the in-memory versions.
pub struct ExternalDeps {
    pub repo: Arc<dyn Repository>,
    pub catalog: Arc<dyn TestCatalog>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub log_fanout: Arc<dyn LogFanout>,
}

/// A request to schedule the tests of a service at a revision
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RunRequest {
    pub service_id: ServiceId,
    pub git_ref: String,
    pub git_sha: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub environment: std::collections::BTreeMap<String, String>,
}

pub struct Orchestrator {
    pub repo: Arc<dyn Repository>,
    pub registry: Arc<AgentRegistry>,
    pub sessions: Arc<SessionManager>,
    pub catalog: Arc<dyn TestCatalog>,
    pub notifier: Arc<dyn NotificationSink>,
    scheduler: Arc<Scheduler>,
    collector: ResultCollector,
    reaper: Arc<LivenessReaper>,
    router: SessionRouter,
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
}

impl Orchestrator {
    pub fn new(config: &Config, deps: ExternalDeps, metrics: CoreMetrics) -> Self {
        let ExternalDeps {
            repo,
            catalog,
            artifacts,
            notifier,
            log_fanout,
        } = deps;

        let registry = Arc::new(AgentRegistry::new(repo.clone(), metrics.registry));
        let sessions = Arc::new(SessionManager::new(metrics.session.clone()));

        let scheduler = Arc::new(Scheduler::new(
            repo.clone(),
            registry.clone(),
            sessions.clone(),
            notifier.clone(),
            config.scheduler_tuning(),
            metrics.scheduler,
        ));
        let scheduler_tx = scheduler.command_sender();

        let collector = ResultCollector::new(
            repo.clone(),
            registry.clone(),
            sessions.clone(),
            notifier.clone(),
            artifacts,
            log_fanout,
            scheduler_tx.clone(),
            config.collector_tuning(),
            metrics.collector,
        );

        let reaper = Arc::new(LivenessReaper::new(
            repo.clone(),
            registry.clone(),
            sessions.clone(),
            notifier.clone(),
            scheduler_tx.clone(),
            config.reaper_tuning(),
            metrics.reaper,
        ));

        let router = SessionRouter::new(
            registry.clone(),
            sessions.clone(),
            collector.handle(),
            scheduler_tx.clone(),
            Authenticator::new(config.auth_mode, config.auth_tokens.clone()),
            notifier.clone(),
            config.agent_config(),
            config.session_tuning(),
            metrics.session,
        );

        Self {
            repo,
            registry,
            sessions,
            catalog,
            notifier,
            scheduler,
            collector,
            reaper,
            router,
            scheduler_tx,
        }
    }

    /// Bring up the scheduler, collector workers and reaper. Sessions are
    /// spawned per accepted connection via [`Orchestrator::serve_agent`].
    #[instrument(skip(self, ctx), fields(subsys = "Orchestrator"))]
    pub fn start(&self, ctx: AppContext) {
        self.scheduler.start(ctx.clone());
        self.collector.start(ctx.clone());
        self.reaper.clone().start(ctx);
    }

    /// Drive one agent connection to completion (the accept loop spawns
    /// this per connection)
    pub async fn serve_agent<T>(
        &self,
        io: T,
        transport_authenticated: bool,
    ) -> Result<(), SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.router.serve(io, transport_authenticated).await
    }

    pub fn collector_handle(&self) -> CollectorHandle {
        self.collector.handle()
    }

    pub fn scheduler_sender(&self) -> mpsc::Sender<SchedulerCommand> {
        self.scheduler_tx.clone()
    }

    /// Resolve the service's test catalog at the requested revision and
    /// queue a run for it.
    #[instrument(skip(self, request), fields(subsys = "Orchestrator", service_id = %request.service_id))]
    pub async fn submit_run(&self, request: RunRequest) -> Result<RunId, OrchestratorError> {
        let service = self
            .repo
            .get_service(&request.service_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownService(request.service_id.clone()))?;

        let tests = self
            .catalog
            .resolve(&service.id, &request.git_ref, &request.git_sha)
            .await?;
        if tests.is_empty() {
            return Err(OrchestratorError::NoTests(service.id.clone()));
        }

        let sha = request.git_sha.clone();
        let run = TestRun {
            id: RunId::generate(),
            service_id: service.id.clone(),
            repo: service.repo.clone(),
            git_ref: request.git_ref,
            git_sha: request.git_sha,
            tests,
            zones: service.default_zones.clone(),
            priority: request.priority,
            status: RunStatus::Pending,
            agent_id: None,
            queued_at: Timestamp::now(),
            started_at: None,
            completed_at: None,
            deadline: None,
            summary: Default::default(),
            orphan_count: 0,
            environment: request.environment,
            run_timeout: service.default_timeout,
        };
        let run_id = run.id.clone();

        self.repo.create_run(run).await?;
        tracing::info!("Run {} queued for service {} at {}", run_id, service.id, sha);

        let _ = self
            .scheduler_tx
            .send(SchedulerCommand::RunQueued(run_id.clone()))
            .await;

        Ok(run_id)
    }

    pub async fn cancel_run(&self, run_id: RunId, reason: String) -> Result<(), OrchestratorError> {
        self.scheduler_tx
            .send(SchedulerCommand::CancelRun { run_id, reason })
            .await
            .map_err(|_| OrchestratorError::Shutdown)
    }

    /// Ask an agent to stop accepting work and finish what it holds
    pub async fn drain_agent(&self, agent_id: &AgentId) -> Result<(), OrchestratorError> {
        let already_empty = self.registry.set_draining(agent_id).await?;
        if already_empty {
            self.sessions.close(agent_id, CloseCause::Drained);
            return Ok(());
        }

        let drain_id = DrainId::generate();
        if let Err(err) = self.sessions.send(
            agent_id,
            proctor_types::CoreMessage::Drain {
                drain_id: drain_id.clone(),
            },
        ) {
            tracing::warn!("Could not deliver drain {} to {}: {}", drain_id, agent_id, err);
        }
        Ok(())
    }

    /// Graceful shutdown: every connected agent gets a drain request
    pub fn drain_all(&self) {
        let drain_id = DrainId::generate();
        tracing::info!("Draining all sessions ({})", drain_id);
        self.sessions.drain_all(&drain_id);
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        self.registry.snapshot().await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<TestRun>, OrchestratorError> {
        Ok(self.repo.get_run(run_id).await?)
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("unknown service {0}")]
    UnknownService(ServiceId),

    #[error("service {0} declares no tests at this revision")]
    NoTests(ServiceId),

    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("repository: {0}")]
    Repo(#[from] RepoError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("core is shutting down")]
    Shutdown,
}
