use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proctor_types::{
    Agent, AgentId, AgentState, AssignWork, RunId, RunStatus, TestRun, Timestamp,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::instrument;
use utils::context::AppContext;
use utils::storage::{RepoError, Repository};
use utils::telemetry::SchedulerMetrics;

use crate::notify::{Event, NotificationSink};
use crate::subsystems::registry::{AgentRegistry, ClaimError};
use crate::subsystems::session::{assign_work, cancel_work, SessionManager};

pub const SCHEDULER_CHANNEL_SIZE: usize = 256;

#[derive(Debug)]
pub enum SchedulerCommand {
    /// A run entered the pending queue
    RunQueued(RunId),
    /// The agent committed to a dispatched run
    WorkAccepted {
        agent_id: AgentId,
        run_id: RunId,
        accepted_at: Timestamp,
    },
    /// The agent turned a dispatched run down
    WorkRejected {
        agent_id: AgentId,
        run_id: RunId,
        reason: String,
    },
    /// Externally requested cancellation
    CancelRun { run_id: RunId, reason: String },
    /// An agent finished something; capacity may be free again
    CapacityFreed,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerTuning {
    /// Bounded periodic wakeup even when no signal arrives
    pub tick: Duration,
    /// How long a dispatched run may sit unaccepted before it is released
    pub accept_timeout: Duration,
    /// Headroom added on top of the per-test timeout sum
    pub dispatch_slack: Duration,
    pub default_run_timeout: Duration,
    /// Clamps whatever the run or its specs ask for
    pub max_run_timeout: Duration,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(30),
            dispatch_slack: Duration::from_secs(60),
            default_run_timeout: Duration::from_secs(30 * 60),
            max_run_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("repository: {0}")]
    Repo(#[from] RepoError),
}

/// Tracks a run that was handed to a session but not yet accepted: an
/// internal substate of Pending that only the scheduler knows about.
struct DispatchedRun {
    agent_id: AgentId,
    accept_deadline: Instant,
    cancel_reason: Option<String>,
}

#[derive(Default)]
struct SchedulerState {
    /// Rejections accumulate a small effective-priority penalty so a run
    /// does not thrash against the same agent
    penalties: HashMap<RunId, i32>,
    dispatched: HashMap<RunId, DispatchedRun>,
}

/// Turns pending runs into per-agent assignments. Runs as a single logical
/// task so capacity decisions are serial; it parks on its command channel,
/// the registry change signal, and a bounded tick.
pub struct Scheduler {
    repo: Arc<dyn Repository>,
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn NotificationSink>,
    command_tx: mpsc::Sender<SchedulerCommand>,
    command_rx: std::sync::Mutex<Option<mpsc::Receiver<SchedulerCommand>>>,
    tuning: SchedulerTuning,
    metrics: SchedulerMetrics,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn NotificationSink>,
        tuning: SchedulerTuning,
        metrics: SchedulerMetrics,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(SCHEDULER_CHANNEL_SIZE);
        Self {
            repo,
            registry,
            sessions,
            notifier,
            command_tx,
            command_rx: std::sync::Mutex::new(Some(command_rx)),
            tuning,
            metrics,
        }
    }

    pub fn command_sender(&self) -> mpsc::Sender<SchedulerCommand> {
        self.command_tx.clone()
    }

    #[instrument(skip(self, ctx), fields(subsys = "Scheduler"))]
    pub fn start(self: &Arc<Self>, ctx: AppContext) {
        let mut command_rx = self
            .command_rx
            .lock()
            .unwrap()
            .take()
            .expect("scheduler started twice");

        let this = self.clone();
        let mut kill_receiver = ctx.get_kill_receiver();

        ctx.rt.clone().spawn(async move {
            let changed = this.registry.changed();
            let mut tick = tokio::time::interval(this.tuning.tick);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut state = SchedulerState::default();

            loop {
                let want_pass = tokio::select! {
                    _ = kill_receiver.recv() => {
                        tracing::debug!("Scheduler shutting down");
                        break;
                    }
                    command = command_rx.recv() => {
                        match command {
                            None => break,
                            Some(command) => this.handle_command(command, &mut state).await,
                        }
                    }
                    _ = changed.notified() => true,
                    _ = tick.tick() => {
                        this.expire_dispatched(&mut state).await;
                        true
                    }
                };

                if want_pass {
                    if let Err(err) = this.schedule_pass(&mut state).await {
                        tracing::error!("Scheduling pass failed: {}", err);
                    }
                }
            }
        });
    }

    async fn handle_command(&self, command: SchedulerCommand, state: &mut SchedulerState) -> bool {
        match command {
            SchedulerCommand::RunQueued(run_id) => {
                tracing::debug!("Run {} queued", run_id);
                true
            }

            SchedulerCommand::CapacityFreed => true,

            SchedulerCommand::WorkAccepted {
                agent_id,
                run_id,
                accepted_at: _,
            } => {
                match state.dispatched.remove(&run_id) {
                    Some(dispatched) => {
                        if dispatched.agent_id != agent_id {
                            tracing::warn!(
                                "Run {} accepted by {} but was dispatched to {}",
                                run_id,
                                agent_id,
                                dispatched.agent_id
                            );
                        }
                        if let Err(err) = self.commit_started(&run_id, &agent_id).await {
                            tracing::error!("Failed to start run {}: {}", run_id, err);
                            let _ = self.registry.release(&agent_id, &run_id).await;
                            let _ = cancel_work(&self.sessions, &agent_id, &run_id, "start failed");
                        }
                    }
                    None => {
                        // the assignment already expired or was never ours
                        tracing::warn!(
                            "Agent {} accepted run {} the scheduler no longer tracks",
                            agent_id,
                            run_id
                        );
                        let _ = cancel_work(
                            &self.sessions,
                            &agent_id,
                            &run_id,
                            "assignment expired",
                        );
                    }
                }
                false
            }

            SchedulerCommand::WorkRejected {
                agent_id,
                run_id,
                reason,
            } => {
                tracing::info!("Agent {} rejected run {}: {}", agent_id, run_id, reason);
                self.metrics.increment_rejected();
                let cancel_reason = state
                    .dispatched
                    .remove(&run_id)
                    .and_then(|d| d.cancel_reason);
                let _ = self.registry.release(&agent_id, &run_id).await;

                if let Some(reason) = cancel_reason {
                    // the run was cancelled while in flight; the rejection
                    // settles it without another dispatch
                    self.finalize_cancelled(&run_id, &reason).await;
                    return false;
                }

                *state.penalties.entry(run_id).or_insert(0) += 1;
                true
            }

            SchedulerCommand::CancelRun { run_id, reason } => {
                self.handle_cancel(&run_id, &reason, state).await;
                false
            }
        }
    }

    async fn handle_cancel(&self, run_id: &RunId, reason: &str, state: &mut SchedulerState) {
        if let Some(dispatched) = state.dispatched.get_mut(run_id) {
            // in flight: the CancelWork chases the AssignWork on the same
            // session; the agent treats the pair first-wins
            dispatched.cancel_reason = Some(reason.to_string());
            let _ = cancel_work(&self.sessions, &dispatched.agent_id, run_id, reason);
            return;
        }

        let run = match self.repo.get_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                tracing::warn!("Cancel for unknown run {}", run_id);
                return;
            }
            Err(err) => {
                tracing::error!("Cancel lookup failed for run {}: {}", run_id, err);
                return;
            }
        };

        match run.status {
            RunStatus::Pending => self.finalize_cancelled(run_id, reason).await,
            RunStatus::Running => {
                if let Some(agent_id) = run.agent_id {
                    let _ = cancel_work(&self.sessions, &agent_id, run_id, reason);
                } else {
                    self.finalize_cancelled(run_id, reason).await;
                }
            }
            // terminal is immutable
            _ => {}
        }
    }

    async fn finalize_cancelled(&self, run_id: &RunId, reason: &str) {
        match self
            .repo
            .finalize_run(run_id, RunStatus::Cancelled, None, Timestamp::now())
            .await
        {
            Ok(run) => {
                tracing::info!("Run {} cancelled: {}", run_id, reason);
                self.notifier.emit(Event::RunFinished {
                    run_id: run.id.clone(),
                    service_id: run.service_id.clone(),
                    status: RunStatus::Cancelled,
                    summary: run.summary,
                    reason: Some(reason.to_string()),
                });
            }
            Err(RepoError::AlreadyTerminal { .. }) => {}
            Err(err) => tracing::error!("Failed to cancel run {}: {}", run_id, err),
        }
    }

    /// Accepted work becomes Running with its deadline recorded for the reaper
    async fn commit_started(&self, run_id: &RunId, agent_id: &AgentId) -> Result<(), SchedulerError> {
        let run = self
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| RepoError::not_found("run", run_id))?;

        let now = Timestamp::now();
        let timeout = self.effective_timeout(&run);
        let deadline = now.plus(timeout.into());

        self.repo
            .mark_run_started(run_id, agent_id, now, deadline)
            .await?;

        tracing::info!(
            "Run {} started on agent {} (deadline in {}s)",
            run_id,
            agent_id,
            timeout.as_secs()
        );
        Ok(())
    }

    /// deadline = max(Σ per-test timeouts + slack, run-level timeout),
    /// clamped by the configured maximum
    fn effective_timeout(&self, run: &TestRun) -> Duration {
        let per_test: u64 = run
            .tests
            .iter()
            .filter_map(|t| t.timeout.map(|d| d.secs))
            .sum();
        let base = per_test + self.tuning.dispatch_slack.as_secs();

        let run_level = run
            .run_timeout
            .map(|d| d.secs)
            .unwrap_or(self.tuning.default_run_timeout.as_secs());

        Duration::from_secs(base.max(run_level).min(self.tuning.max_run_timeout.as_secs()))
    }

    /// Dispatches that were never accepted go back to pending with a penalty
    async fn expire_dispatched(&self, state: &mut SchedulerState) {
        let now = Instant::now();
        let expired: Vec<RunId> = state
            .dispatched
            .iter()
            .filter(|(_, d)| d.accept_deadline <= now)
            .map(|(run_id, _)| run_id.clone())
            .collect();

        for run_id in expired {
            let Some(dispatched) = state.dispatched.remove(&run_id) else {
                continue;
            };
            tracing::warn!(
                "Run {} dispatched to {} was never accepted",
                run_id,
                dispatched.agent_id
            );
            let _ = self.registry.release(&dispatched.agent_id, &run_id).await;
            match dispatched.cancel_reason {
                Some(reason) => self.finalize_cancelled(&run_id, &reason).await,
                None => {
                    *state.penalties.entry(run_id).or_insert(0) += 1;
                }
            }
        }
    }

    /// One round-robin decision pass over the pending queue
    async fn schedule_pass(&self, state: &mut SchedulerState) -> Result<(), SchedulerError> {
        let pending = self.repo.list_pending_runs().await?;
        let agents = self.registry.snapshot().await;
        self.metrics.record_pass(pending.len() as u64);

        let mut queue: Vec<&TestRun> = pending
            .iter()
            .filter(|run| !state.dispatched.contains_key(&run.id))
            .collect();

        // effective priority folds in the rejection penalty
        queue.sort_by(|a, b| {
            let pa = a.priority - state.penalties.get(&a.id).copied().unwrap_or(0);
            let pb = b.priority - state.penalties.get(&b.id).copied().unwrap_or(0);
            pb.cmp(&pa)
                .then_with(|| a.queued_at.cmp(&b.queued_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        for run in queue {
            let unresolved = run.unresolved_dependencies();
            if !unresolved.is_empty() {
                tracing::warn!(
                    "Run {} skipped: depends_on references tests outside the run: {:?}",
                    run.id,
                    unresolved
                );
                continue;
            }

            let mut candidates: Vec<&Agent> = agents
                .iter()
                .filter(|agent| Self::eligible(agent, run))
                .collect();

            // idle before busy, then least-recently heartbeated, then id
            candidates.sort_by(|a, b| {
                let ka = (a.state != AgentState::Idle, a.last_heartbeat, &a.id);
                let kb = (b.state != AgentState::Idle, b.last_heartbeat, &b.id);
                ka.cmp(&kb)
            });

            if candidates.is_empty() {
                if run.is_exclusive() {
                    // exclusivity blocks the head of line until it places
                    break;
                }
                continue;
            }

            let mut placed = false;
            for agent in candidates {
                match self.registry.claim(&agent.id, run).await {
                    Ok(()) => {
                        let work = self.build_assignment(run);
                        match assign_work(&self.sessions, &agent.id, work) {
                            Ok(()) => {
                                state.dispatched.insert(
                                    run.id.clone(),
                                    DispatchedRun {
                                        agent_id: agent.id.clone(),
                                        accept_deadline: Instant::now()
                                            + self.tuning.accept_timeout,
                                        cancel_reason: None,
                                    },
                                );
                                self.metrics.increment_dispatched();
                                tracing::info!(
                                    "Run {} dispatched to agent {}",
                                    run.id,
                                    agent.id
                                );
                                placed = true;
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(
                                    "Dispatch of run {} to {} failed: {}",
                                    run.id,
                                    agent.id,
                                    err
                                );
                                let _ = self.registry.release(&agent.id, &run.id).await;
                            }
                        }
                    }
                    // the snapshot was stale; try the next candidate
                    Err(ClaimError::CapacityExceeded) | Err(ClaimError::NotEligible(_)) => {}
                    Err(err) => {
                        tracing::error!(
                            "Claim of {} for run {} failed: {}",
                            agent.id,
                            run.id,
                            err
                        );
                    }
                }
            }

            if !placed && run.is_exclusive() {
                break;
            }
        }

        Ok(())
    }

    fn eligible(agent: &Agent, run: &TestRun) -> bool {
        if !agent.state.accepts_work() {
            return false;
        }
        if agent.residual_capacity() == 0 {
            return false;
        }
        if !agent.reaches(&run.zones) {
            return false;
        }
        if run.is_exclusive() && !(agent.state == AgentState::Idle && agent.active_runs.is_empty())
        {
            return false;
        }
        true
    }

    fn build_assignment(&self, run: &TestRun) -> AssignWork {
        AssignWork {
            run_id: run.id.clone(),
            priority: run.priority,
            repo: run.repo.clone(),
            git_ref: run.git_ref.clone(),
            git_sha: run.git_sha.clone(),
            tests: run.tests.clone(),
            environment: run.environment.clone(),
            secrets: Default::default(),
            timeout_s: self.effective_timeout(run).as_secs(),
            attempt: 1,
        }
    }
}
