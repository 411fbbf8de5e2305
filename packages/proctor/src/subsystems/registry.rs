use std::collections::HashMap;
use std::sync::Arc;

use proctor_types::{
    Agent, AgentId, AgentState, Heartbeat, RegisterRequest, RunId, TestRun, Timestamp,
};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::instrument;
use utils::storage::{RepoError, Repository};
use utils::telemetry::RegistryMetrics;

/// Source of truth for agent identity, capabilities, status and load.
///
/// The in-memory map is the only mutable shared structure of note in the
/// core. Every mutation holds the one mutex across at most one repository
/// round-trip, and a failing write never updates memory — the critical
/// section is the atomicity boundary the scheduler and reaper both rely on.
pub struct AgentRegistry {
    inner: Mutex<RegistryInner>,
    repo: Arc<dyn Repository>,
    changed: Arc<Notify>,
    metrics: RegistryMetrics,
}

#[derive(Default)]
struct RegistryInner {
    agents: HashMap<AgentId, Agent>,
    /// Agents currently serving an exclusive run; nothing else may be
    /// claimed on them until that run releases
    exclusive: HashMap<AgentId, RunId>,
}

/// What a heartbeat told us that we didn't already believe
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    /// Runs the agent reports but the registry never assigned (stale
    /// dispatch) — the session answers each with a CancelWork
    pub unknown_runs: Vec<RunId>,
    /// Runs the registry believes assigned but the agent stopped
    /// reporting — logged here, resolved by the reaper
    pub missing_runs: Vec<RunId>,
}

#[derive(Debug)]
pub struct ReleaseOutcome {
    /// The agent was draining and this release emptied it
    pub drained: bool,
}

impl AgentRegistry {
    pub fn new(repo: Arc<dyn Repository>, metrics: RegistryMetrics) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            repo,
            changed: Arc::new(Notify::new()),
            metrics,
        }
    }

    /// Notified whenever eligibility may have improved: a registration,
    /// a release, a drain reversal. The scheduler parks on this.
    pub fn changed(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    /// Register a new agent or replace the capabilities of a known one.
    /// Unknown or absent ids get a freshly minted one. Active runs survive
    /// re-registration so a reconnecting agent keeps reporting on them.
    #[instrument(skip(self, req), fields(subsys = "Registry", agent_name = %req.name))]
    pub async fn register(&self, req: &RegisterRequest) -> Result<Agent, RegistryError> {
        let mut inner = self.inner.lock().await;

        let existing = req
            .agent_id
            .as_ref()
            .and_then(|id| inner.agents.get(id).cloned());

        let agent = match existing {
            Some(mut agent) => {
                agent.name = req.name.clone();
                agent.version = req.version.clone();
                agent.caps = req.caps.clone();
                agent.last_heartbeat = Timestamp::now();
                // a fresh connection clears draining/offline
                agent.state = if agent.active_runs.is_empty() {
                    AgentState::Idle
                } else {
                    AgentState::Busy
                };
                agent
            }
            None => Agent {
                id: AgentId::generate(),
                name: req.name.clone(),
                version: req.version.clone(),
                caps: req.caps.clone(),
                state: AgentState::Idle,
                last_heartbeat: Timestamp::now(),
                active_runs: Default::default(),
            },
        };

        self.repo.upsert_agent(agent.clone()).await?;
        inner.agents.insert(agent.id.clone(), agent.clone());

        self.metrics.increment_registrations();
        tracing::info!(
            "Agent registered: agent_id={}, name={}, zones={:?}, max_parallel={}",
            agent.id,
            agent.name,
            agent.caps.zones,
            agent.caps.max_parallel
        );

        self.changed.notify_waiters();
        Ok(agent)
    }

    #[instrument(skip(self, hb), fields(subsys = "Registry", agent_id = %hb.agent_id))]
    pub async fn heartbeat(&self, hb: &Heartbeat) -> Result<HeartbeatOutcome, RegistryError> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .agents
            .get_mut(&hb.agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(hb.agent_id.clone()))?;

        let ts = Timestamp::now();
        self.repo.update_heartbeat(&hb.agent_id, ts).await?;
        agent.last_heartbeat = ts;

        let outcome = HeartbeatOutcome {
            unknown_runs: hb
                .active_runs
                .iter()
                .filter(|run| !agent.active_runs.contains(run))
                .cloned()
                .collect(),
            missing_runs: agent
                .active_runs
                .iter()
                .filter(|run| !hb.active_runs.contains(run))
                .cloned()
                .collect(),
        };

        if !outcome.unknown_runs.is_empty() {
            tracing::warn!(
                "Agent {} reports runs the registry never assigned: {:?}",
                hb.agent_id,
                outcome.unknown_runs
            );
        }
        if !outcome.missing_runs.is_empty() {
            tracing::debug!(
                "Agent {} stopped reporting assigned runs: {:?}",
                hb.agent_id,
                outcome.missing_runs
            );
        }

        self.metrics.increment_heartbeats();
        Ok(outcome)
    }

    /// Atomically add a run to an agent's active set under the capacity
    /// invariant. The zone/exclusivity checks re-run here because the
    /// scheduler works from a snapshot that may already be stale.
    #[instrument(skip(self, run), fields(subsys = "Registry", run_id = %run.id))]
    pub async fn claim(&self, agent_id: &AgentId, run: &TestRun) -> Result<(), ClaimError> {
        let mut inner = self.inner.lock().await;
        if inner.exclusive.contains_key(agent_id) {
            self.metrics.increment_claim_conflicts();
            return Err(ClaimError::NotEligible(
                "agent is running an exclusive run".to_string(),
            ));
        }
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ClaimError::UnknownAgent(agent_id.clone()))?;

        match agent.state {
            AgentState::Draining => {
                self.metrics.increment_claim_conflicts();
                return Err(ClaimError::NotEligible("agent is draining".to_string()));
            }
            AgentState::Offline | AgentState::Connecting => {
                self.metrics.increment_claim_conflicts();
                return Err(ClaimError::NotEligible(format!(
                    "agent is {}",
                    agent.state
                )));
            }
            AgentState::Idle | AgentState::Busy => {}
        }

        if !agent.reaches(&run.zones) {
            self.metrics.increment_claim_conflicts();
            return Err(ClaimError::NotEligible(format!(
                "agent zones {:?} do not cover {:?}",
                agent.caps.zones, run.zones
            )));
        }

        if run.is_exclusive() && !agent.active_runs.is_empty() {
            self.metrics.increment_claim_conflicts();
            return Err(ClaimError::NotEligible(
                "exclusive run requires an idle agent".to_string(),
            ));
        }

        if agent.residual_capacity() == 0 {
            self.metrics.increment_claim_conflicts();
            return Err(ClaimError::CapacityExceeded);
        }

        let mut updated = agent.clone();
        updated.active_runs.insert(run.id.clone());
        updated.recompute_state();

        self.repo.upsert_agent(updated.clone()).await?;
        *agent = updated;
        if run.is_exclusive() {
            inner.exclusive.insert(agent_id.clone(), run.id.clone());
        }

        Ok(())
    }

    /// Remove a run from an agent's active set. Idempotent: releasing a
    /// run that is not held (or an agent we no longer know) is a no-op.
    #[instrument(skip(self), fields(subsys = "Registry"))]
    pub async fn release(
        &self,
        agent_id: &AgentId,
        run_id: &RunId,
    ) -> Result<ReleaseOutcome, RegistryError> {
        let mut inner = self.inner.lock().await;
        let Some(agent) = inner.agents.get_mut(agent_id) else {
            return Ok(ReleaseOutcome { drained: false });
        };

        if !agent.active_runs.contains(run_id) {
            return Ok(ReleaseOutcome { drained: false });
        }

        let mut updated = agent.clone();
        updated.active_runs.remove(run_id);
        let drained = updated.state == AgentState::Draining && updated.active_runs.is_empty();
        if drained {
            updated.state = AgentState::Offline;
        } else {
            updated.recompute_state();
        }

        self.repo.upsert_agent(updated.clone()).await?;
        *agent = updated;
        if inner.exclusive.get(agent_id) == Some(run_id) {
            inner.exclusive.remove(agent_id);
        }

        self.changed.notify_waiters();
        Ok(ReleaseOutcome { drained })
    }

    /// The registry refuses claims from here on; returns true when the
    /// agent had nothing running and is already fully drained.
    #[instrument(skip(self), fields(subsys = "Registry"))]
    pub async fn set_draining(&self, agent_id: &AgentId) -> Result<bool, RegistryError> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.clone()))?;

        let mut updated = agent.clone();
        let drained = updated.active_runs.is_empty();
        updated.state = if drained {
            AgentState::Offline
        } else {
            AgentState::Draining
        };

        self.repo.upsert_agent(updated.clone()).await?;
        *agent = updated;

        Ok(drained)
    }

    /// The agent finished its drain; everything should already be released
    #[instrument(skip(self), fields(subsys = "Registry"))]
    pub async fn drain_complete(&self, agent_id: &AgentId) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.clone()))?;

        if !agent.active_runs.is_empty() {
            tracing::warn!(
                "Agent {} reported drain complete while still holding {:?}",
                agent_id,
                agent.active_runs
            );
        }

        let mut updated = agent.clone();
        updated.state = AgentState::Offline;

        self.repo.upsert_agent(updated.clone()).await?;
        *agent = updated;
        inner.exclusive.remove(agent_id);

        Ok(())
    }

    /// Mark an agent offline after missed heartbeats, returning its active
    /// runs as orphan candidates. The set itself stays intact — the reaper
    /// resolves each orphan via requeue or failure, releasing one by one.
    #[instrument(skip(self), fields(subsys = "Registry"))]
    pub async fn mark_offline(&self, agent_id: &AgentId) -> Result<Vec<RunId>, RegistryError> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.clone()))?;

        let mut updated = agent.clone();
        updated.state = AgentState::Offline;
        let orphans: Vec<RunId> = updated.active_runs.iter().cloned().collect();

        self.repo.upsert_agent(updated.clone()).await?;
        *agent = updated;

        Ok(orphans)
    }

    pub async fn get(&self, agent_id: &AgentId) -> Option<Agent> {
        self.inner.lock().await.agents.get(agent_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Agent> {
        self.inner.lock().await.agents.values().cloned().collect()
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("repository: {0}")]
    Repo(#[from] RepoError),
}

#[derive(Error, Debug)]
pub enum ClaimError {
    #[error("agent is at capacity")]
    CapacityExceeded,

    #[error("agent not eligible: {0}")]
    NotEligible(String),

    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("repository: {0}")]
    Repo(#[from] RepoError),
}
