use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proctor_types::{AgentId, AgentState, RunId, RunStatus, Timestamp};
use tokio::sync::{mpsc, Mutex};
use tracing::instrument;
use utils::context::AppContext;
use utils::storage::{RepoError, Repository};
use utils::telemetry::ReaperMetrics;

use crate::notify::{Event, NotificationSink};
use crate::subsystems::registry::AgentRegistry;
use crate::subsystems::scheduler::SchedulerCommand;
use crate::subsystems::session::{cancel_work, SessionManager};

#[derive(Debug, Clone, Copy)]
pub struct ReaperTuning {
    pub tick: Duration,
    /// An agent silent this long is marked offline
    pub heartbeat_timeout: Duration,
    /// Orphaned runs wait this long for their agent to come back
    pub orphan_window: Duration,
    /// Requeues granted before an orphan fails with AgentLost
    pub max_orphan_requeues: u32,
    /// Time between CancelWork and force-finalizing a deadline breach
    pub cancel_grace: Duration,
}

impl Default for ReaperTuning {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(90),
            orphan_window: Duration::from_secs(120),
            max_orphan_requeues: 1,
            cancel_grace: Duration::from_secs(60),
        }
    }
}

struct OrphanEntry {
    agent_id: AgentId,
    expires: Timestamp,
}

/// Detects missed heartbeats, resolves orphaned runs, and enforces run
/// deadlines. A single periodic task; every mutation goes through the
/// registry's claim/release critical section so it cannot interleave with
/// the scheduler's accounting.
pub struct LivenessReaper {
    repo: Arc<dyn Repository>,
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn NotificationSink>,
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
    tuning: ReaperTuning,
    metrics: ReaperMetrics,
    /// orphan candidates carried across sweeps
    orphans: Mutex<HashMap<RunId, OrphanEntry>>,
    /// deadline-breached runs we already told to cancel
    cancels_sent: Mutex<HashMap<RunId, Timestamp>>,
}

impl LivenessReaper {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn NotificationSink>,
        scheduler_tx: mpsc::Sender<SchedulerCommand>,
        tuning: ReaperTuning,
        metrics: ReaperMetrics,
    ) -> Self {
        Self {
            repo,
            registry,
            sessions,
            notifier,
            scheduler_tx,
            tuning,
            metrics,
            orphans: Mutex::new(HashMap::new()),
            cancels_sent: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, ctx), fields(subsys = "Reaper"))]
    pub fn start(self: Arc<Self>, ctx: AppContext) {
        let mut kill_receiver = ctx.get_kill_receiver();

        ctx.rt.clone().spawn(async move {
            let mut tick = tokio::time::interval(self.tuning.tick);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = kill_receiver.recv() => {
                        tracing::debug!("Reaper shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        self.sweep().await;
                    }
                }
            }
        });
    }

    /// One full pass: offline detection, orphan resolution, deadlines
    pub async fn sweep(&self) {
        let now = Timestamp::now();
        self.detect_offline(now).await;
        self.resolve_orphans(now).await;
        self.enforce_deadlines(now).await;
    }

    async fn detect_offline(&self, now: Timestamp) {
        let mut orphans = self.orphans.lock().await;
        for agent in self.registry.snapshot().await {
            if agent.state == AgentState::Offline {
                continue;
            }
            if now.since(agent.last_heartbeat) <= self.tuning.heartbeat_timeout {
                continue;
            }

            tracing::warn!(
                "Agent {} missed heartbeats for {:?}, marking offline",
                agent.id,
                now.since(agent.last_heartbeat)
            );

            match self.registry.mark_offline(&agent.id).await {
                Ok(orphaned_runs) => {
                    self.metrics.increment_agents_reaped();
                    self.sessions.close(
                        &agent.id,
                        crate::subsystems::session::CloseCause::PeerClosed,
                    );
                    self.notifier.emit(Event::AgentStatus {
                        agent_id: agent.id.clone(),
                        state: AgentState::Offline,
                    });

                    let expires = now.plus(self.tuning.orphan_window.into());
                    for run_id in orphaned_runs {
                        tracing::info!(
                            "Run {} orphaned by agent {}, window expires at {}",
                            run_id,
                            agent.id,
                            expires
                        );
                        orphans.insert(
                            run_id,
                            OrphanEntry {
                                agent_id: agent.id.clone(),
                                expires,
                            },
                        );
                    }
                }
                Err(err) => {
                    tracing::error!("Failed to mark agent {} offline: {}", agent.id, err);
                }
            }
        }
    }

    async fn resolve_orphans(&self, now: Timestamp) {
        let mut orphans = self.orphans.lock().await;
        let due: Vec<RunId> = orphans
            .iter()
            .filter_map(|(run_id, entry)| {
                // a reconnect inside the window keeps the run alive and
                // removes it from tracking
                if self.sessions.is_connected(&entry.agent_id) {
                    return Some(run_id.clone());
                }
                if entry.expires <= now {
                    return Some(run_id.clone());
                }
                None
            })
            .collect();

        for run_id in due {
            let Some(entry) = orphans.remove(&run_id) else {
                continue;
            };

            if self.sessions.is_connected(&entry.agent_id) {
                tracing::info!(
                    "Agent {} reconnected inside the orphan window; run {} continues",
                    entry.agent_id,
                    run_id
                );
                continue;
            }

            let run = match self.repo.get_run(&run_id).await {
                Ok(Some(run)) => run,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!("Orphan lookup failed for run {}: {}", run_id, err);
                    continue;
                }
            };
            if run.status.is_terminal() {
                continue;
            }

            if let Err(err) = self.registry.release(&entry.agent_id, &run_id).await {
                tracing::error!(
                    "Failed to release orphan {} from agent {}: {}",
                    run_id,
                    entry.agent_id,
                    err
                );
            }

            if run.orphan_count < self.tuning.max_orphan_requeues {
                match self.repo.requeue_run(&run_id, run.orphan_count + 1).await {
                    Ok(_) => {
                        self.metrics.increment_runs_requeued();
                        tracing::info!(
                            "Run {} re-queued after agent loss (orphan_count={})",
                            run_id,
                            run.orphan_count + 1
                        );
                        let _ = self
                            .scheduler_tx
                            .send(SchedulerCommand::RunQueued(run_id.clone()))
                            .await;
                    }
                    Err(err) => {
                        tracing::error!("Failed to requeue orphan {}: {}", run_id, err);
                    }
                }
            } else {
                self.fail_run(&run_id, "AgentLost").await;
                self.metrics.increment_runs_failed();
            }
        }
    }

    async fn enforce_deadlines(&self, now: Timestamp) {
        let mut cancels_sent = self.cancels_sent.lock().await;
        let running = match self.repo.list_running_runs().await {
            Ok(running) => running,
            Err(err) => {
                tracing::error!("Failed to list running runs: {}", err);
                return;
            }
        };

        for run in running {
            let Some(deadline) = run.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }

            let session_alive = run
                .agent_id
                .as_ref()
                .map(|agent| self.sessions.is_connected(agent))
                .unwrap_or(false);

            match cancels_sent.get(&run.id) {
                None if session_alive => {
                    // ask the agent first; force it on a later sweep
                    let agent_id = run.agent_id.as_ref().expect("session_alive implies agent");
                    tracing::warn!(
                        "Run {} exceeded its deadline; cancelling on agent {}",
                        run.id,
                        agent_id
                    );
                    let _ = cancel_work(&self.sessions, agent_id, &run.id, "deadline exceeded");
                    cancels_sent.insert(run.id.clone(), now.plus(self.tuning.cancel_grace.into()));
                }
                Some(force_at) if *force_at > now => {}
                _ => {
                    // no session, or the agent ignored the cancel
                    self.timeout_run(&run.id, run.agent_id.as_ref()).await;
                    cancels_sent.remove(&run.id);
                }
            }
        }

        // drop tracking for runs that reached a terminal state on their own
        let stale: Vec<RunId> = {
            let mut stale = Vec::new();
            for run_id in cancels_sent.keys() {
                match self.repo.get_run(run_id).await {
                    Ok(Some(run)) if !run.status.is_terminal() => {}
                    _ => stale.push(run_id.clone()),
                }
            }
            stale
        };
        for run_id in stale {
            cancels_sent.remove(&run_id);
        }
    }

    async fn timeout_run(&self, run_id: &RunId, agent_id: Option<&AgentId>) {
        match self
            .repo
            .finalize_run(run_id, RunStatus::Timeout, None, Timestamp::now())
            .await
        {
            Ok(run) => {
                self.metrics.increment_runs_timed_out();
                tracing::warn!("Run {} finalized as timed out", run_id);
                if let Some(agent_id) = agent_id {
                    let _ = self.registry.release(agent_id, run_id).await;
                }
                self.notifier.emit(Event::RunFinished {
                    run_id: run.id.clone(),
                    service_id: run.service_id.clone(),
                    status: RunStatus::Timeout,
                    summary: run.summary,
                    reason: Some("deadline exceeded".to_string()),
                });
            }
            Err(RepoError::AlreadyTerminal { .. }) => {}
            Err(err) => {
                tracing::error!("Failed to finalize timed out run {}: {}", run_id, err);
            }
        }
    }

    async fn fail_run(&self, run_id: &RunId, reason: &str) {
        match self
            .repo
            .finalize_run(run_id, RunStatus::Error, None, Timestamp::now())
            .await
        {
            Ok(run) => {
                tracing::warn!("Run {} failed: {}", run_id, reason);
                self.notifier.emit(Event::RunFinished {
                    run_id: run.id.clone(),
                    service_id: run.service_id.clone(),
                    status: RunStatus::Error,
                    summary: run.summary,
                    reason: Some(reason.to_string()),
                });
            }
            Err(RepoError::AlreadyTerminal { .. }) => {}
            Err(err) => {
                tracing::error!("Failed to fail run {}: {}", run_id, err);
            }
        }
    }
}
