pub mod parsers;

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use proctor_types::{
    AgentId, ArtifactBytes, ArtifactPayload, ArtifactRef, LogStream, ResultPayload, RunId,
    RunOutcome, RunStatus, RunSummary, TestResult, TestRun, TestStatus, Timestamp,
};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::instrument;
use utils::context::AppContext;
use utils::storage::{RepoError, Repository};
use utils::telemetry::CollectorMetrics;

use crate::artifacts::ArtifactStore;
use crate::notify::{Event, NotificationSink};
use crate::subsystems::registry::AgentRegistry;
use crate::subsystems::scheduler::SchedulerCommand;
use crate::subsystems::session::{CloseCause, SessionManager};

pub const COLLECTOR_CHANNEL_SIZE: usize = 256;

/// Finalized runs remembered per worker so late duplicates are dropped
/// quietly instead of hitting the repository.
const CLOSED_RUNS_REMEMBERED: usize = 1024;

#[derive(Debug)]
pub struct CollectorEvent {
    pub agent_id: AgentId,
    pub run_id: RunId,
    pub payload: ResultPayload,
}

enum WorkerMessage {
    Event(CollectorEvent),
    /// Scheduled after RunComplete once the drain window elapses
    Finalize { run_id: RunId },
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorTuning {
    /// Worker count; `hash(run_id) mod workers` keys every message for one
    /// run onto the same worker, preserving within-run order
    pub workers: usize,
    /// Inline artifact payloads above this are refused
    pub max_inline_bytes: u64,
    /// Grace for per-test rows still in flight behind a RunComplete
    pub drain_window: Duration,
    /// Ring buffer cap for buffered log bytes per run
    pub log_buffer_bytes: usize,
}

impl Default for CollectorTuning {
    fn default() -> Self {
        Self {
            workers: 4,
            max_inline_bytes: 1024 * 1024,
            drain_window: Duration::from_secs(2),
            log_buffer_bytes: 256 * 1024,
        }
    }
}

/// Receives streamed log chunks for live tailing; the dashboard
/// collaborator implements this. Must not block.
pub trait LogFanout: Send + Sync + 'static {
    fn forward(&self, run_id: &RunId, stream: LogStream, bytes: &[u8], ts_ms: u64);
}

pub struct NullLogFanout;

impl LogFanout for NullLogFanout {
    fn forward(&self, _run_id: &RunId, _stream: LogStream, _bytes: &[u8], _ts_ms: u64) {}
}

/// Cheap cloneable route into the worker pool; the session layer holds one
#[derive(Clone)]
pub struct CollectorHandle {
    senders: Vec<mpsc::Sender<WorkerMessage>>,
}

impl CollectorHandle {
    fn shard(&self, run_id: &RunId) -> usize {
        let digest = Sha256::digest(run_id.as_ref().as_bytes());
        let mut eight = [0u8; 8];
        eight.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(eight) % self.senders.len() as u64) as usize
    }

    pub async fn dispatch(&self, event: CollectorEvent) {
        let shard = self.shard(&event.run_id);
        if self.senders[shard]
            .send(WorkerMessage::Event(event))
            .await
            .is_err()
        {
            tracing::error!("Collector worker {} is gone", shard);
        }
    }
}

/// Consumes the streamed result protocol, normalizes, persists
/// progressively, and finalizes runs. N workers, sharded by run id.
pub struct ResultCollector {
    handle: CollectorHandle,
    receivers: std::sync::Mutex<Option<Vec<mpsc::Receiver<WorkerMessage>>>>,
    deps: Arc<WorkerDeps>,
    tuning: CollectorTuning,
}

struct WorkerDeps {
    repo: Arc<dyn Repository>,
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn NotificationSink>,
    artifacts: Arc<dyn ArtifactStore>,
    fanout: Arc<dyn LogFanout>,
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
    metrics: CollectorMetrics,
}

impl ResultCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn NotificationSink>,
        artifacts: Arc<dyn ArtifactStore>,
        fanout: Arc<dyn LogFanout>,
        scheduler_tx: mpsc::Sender<SchedulerCommand>,
        tuning: CollectorTuning,
        metrics: CollectorMetrics,
    ) -> Self {
        let workers = tuning.workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(COLLECTOR_CHANNEL_SIZE);
            senders.push(tx);
            receivers.push(rx);
        }

        Self {
            handle: CollectorHandle { senders },
            receivers: std::sync::Mutex::new(Some(receivers)),
            deps: Arc::new(WorkerDeps {
                repo,
                registry,
                sessions,
                notifier,
                artifacts,
                fanout,
                scheduler_tx,
                metrics,
            }),
            tuning,
        }
    }

    pub fn handle(&self) -> CollectorHandle {
        self.handle.clone()
    }

    #[instrument(skip(self, ctx), fields(subsys = "Collector"))]
    pub fn start(&self, ctx: AppContext) {
        let receivers = self
            .receivers
            .lock()
            .unwrap()
            .take()
            .expect("collector started twice");

        for (index, rx) in receivers.into_iter().enumerate() {
            let worker = CollectorWorker {
                index,
                deps: self.deps.clone(),
                tuning: self.tuning,
                own_sender: self.handle.senders[index].clone(),
            };
            let mut kill_receiver = ctx.get_kill_receiver();
            ctx.rt.clone().spawn(async move {
                worker.run(rx, &mut kill_receiver).await;
            });
        }
    }
}

struct LogEntry {
    stream: LogStream,
    bytes: Vec<u8>,
    ts_ms: u64,
}

/// Per-run bookkeeping while the run streams
struct RunTracker {
    run: TestRun,
    /// test name -> (attempt, status, allow_failure): latest attempt wins
    latest: HashMap<String, (u32, TestStatus, bool)>,
    logs: VecDeque<LogEntry>,
    log_bytes: usize,
    /// Set once RunComplete arrived; finalization fires after the drain window
    complete: Option<(AgentId, RunOutcome, RunSummary, Timestamp)>,
}

impl RunTracker {
    fn summary_from_rows(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.latest.len() as u32,
            ..Default::default()
        };
        for (_, status, _) in self.latest.values() {
            match status {
                TestStatus::Pass => summary.passed += 1,
                TestStatus::Fail | TestStatus::Error => summary.failed += 1,
                TestStatus::Skip => summary.skipped += 1,
            }
        }
        summary
    }

    /// True when every failing row belongs to an allow_failure spec
    fn only_allowed_failures(&self) -> bool {
        self.latest
            .values()
            .filter(|(_, status, _)| matches!(status, TestStatus::Fail | TestStatus::Error))
            .all(|(_, _, allowed)| *allowed)
    }
}

struct CollectorWorker {
    index: usize,
    deps: Arc<WorkerDeps>,
    tuning: CollectorTuning,
    own_sender: mpsc::Sender<WorkerMessage>,
}

impl CollectorWorker {
    async fn run(
        &self,
        mut rx: mpsc::Receiver<WorkerMessage>,
        kill_receiver: &mut tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut active: HashMap<RunId, RunTracker> = HashMap::new();
        let mut closed: LruCache<RunId, ()> =
            LruCache::new(NonZeroUsize::new(CLOSED_RUNS_REMEMBERED).unwrap());

        loop {
            tokio::select! {
                _ = kill_receiver.recv() => {
                    tracing::debug!("Collector worker {} shutting down", self.index);
                    break;
                }
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    match message {
                        WorkerMessage::Event(event) => {
                            self.handle_event(event, &mut active, &mut closed).await;
                        }
                        WorkerMessage::Finalize { run_id } => {
                            self.finalize(&run_id, &mut active, &mut closed).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(
        &self,
        event: CollectorEvent,
        active: &mut HashMap<RunId, RunTracker>,
        closed: &mut LruCache<RunId, ()>,
    ) {
        let CollectorEvent {
            agent_id,
            run_id,
            payload,
        } = event;

        if closed.contains(&run_id) {
            tracing::debug!("Dropping message for finalized run {}", run_id);
            return;
        }

        if !active.contains_key(&run_id) {
            // first touch: materialize the tracker from the repository
            match self.deps.repo.get_run(&run_id).await {
                Ok(Some(run)) if !run.status.is_terminal() => {
                    active.insert(
                        run_id.clone(),
                        RunTracker {
                            run,
                            latest: HashMap::new(),
                            logs: VecDeque::new(),
                            log_bytes: 0,
                            complete: None,
                        },
                    );
                }
                Ok(Some(_)) => {
                    closed.put(run_id.clone(), ());
                    tracing::debug!("Dropping message for terminal run {}", run_id);
                    return;
                }
                Ok(None) => {
                    // unknown run ids are logged and dropped, never fatal
                    tracing::warn!(
                        "Agent {} streamed results for unknown run {}",
                        agent_id,
                        run_id
                    );
                    return;
                }
                Err(err) => {
                    tracing::error!("Run lookup failed for {}: {}", run_id, err);
                    return;
                }
            }
        }

        match payload {
            ResultPayload::LogChunk { stream, bytes, ts_ms } => {
                self.deps.fanout.forward(&run_id, stream, &bytes, ts_ms);
                let tracker = active.get_mut(&run_id).expect("tracker just ensured");
                tracker.log_bytes += bytes.len();
                tracker.logs.push_back(LogEntry { stream, bytes, ts_ms });
                while tracker.log_bytes > self.tuning.log_buffer_bytes {
                    let Some(dropped) = tracker.logs.pop_front() else {
                        break;
                    };
                    tracker.log_bytes -= dropped.bytes.len();
                }
            }

            ResultPayload::TestResult(result) => {
                self.persist_result(&run_id, result, active).await;
            }

            ResultPayload::Artifact(artifact) => {
                self.handle_artifact(&run_id, artifact, active).await;
            }

            ResultPayload::RunComplete {
                outcome,
                summary,
                completed_at_ms,
            } => {
                let tracker = active.get_mut(&run_id).expect("tracker just ensured");
                tracker.complete = Some((
                    agent_id,
                    outcome,
                    summary,
                    Timestamp::from_millis(completed_at_ms),
                ));

                // rows for this run may still be in flight behind the
                // completion; give them the drain window, then settle
                let own_sender = self.own_sender.clone();
                let drain = self.tuning.drain_window;
                let run_id = run_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(drain).await;
                    let _ = own_sender.send(WorkerMessage::Finalize { run_id }).await;
                });
            }
        }
    }

    async fn persist_result(
        &self,
        run_id: &RunId,
        result: TestResult,
        active: &mut HashMap<RunId, RunTracker>,
    ) {
        let tracker = active.get_mut(run_id).expect("tracker just ensured");

        match self.deps.repo.append_result(run_id, result.clone()).await {
            Ok(true) => self.deps.metrics.increment_results_persisted(),
            Ok(false) => {
                // at-least-once delivery across reconnects; the natural key
                // (run, test, attempt) collapses the duplicate
                self.deps.metrics.increment_duplicates_dropped();
                tracing::debug!(
                    "Duplicate result for run {} test {} attempt {}",
                    run_id,
                    result.name,
                    result.attempt
                );
                return;
            }
            Err(err) => {
                tracing::error!("Failed to persist result for run {}: {}", run_id, err);
                return;
            }
        }

        let spec = tracker.run.spec(&result.name).cloned();
        let allow_failure = spec.as_ref().map(|s| s.allow_failure).unwrap_or(false);

        let entry = tracker
            .latest
            .entry(result.name.clone())
            .or_insert((0, result.status, allow_failure));
        if result.attempt >= entry.0 {
            *entry = (result.attempt, result.status, allow_failure);
        }

        let summary = tracker.summary_from_rows();
        if let Err(err) = self.deps.repo.update_run_summary(run_id, summary).await {
            tracing::error!("Failed to update summary for run {}: {}", run_id, err);
        }

        // failed tests with retry budget left go straight back to the same
        // agent while the run is still live
        if matches!(result.status, TestStatus::Fail | TestStatus::Error)
            && tracker.complete.is_none()
        {
            if let Some(spec) = spec {
                if result.attempt <= spec.retries {
                    if let Some(agent_id) = tracker.run.agent_id.clone() {
                        let retry = proctor_types::AssignWork {
                            run_id: run_id.clone(),
                            priority: tracker.run.priority,
                            repo: tracker.run.repo.clone(),
                            git_ref: tracker.run.git_ref.clone(),
                            git_sha: tracker.run.git_sha.clone(),
                            tests: vec![spec.clone()],
                            environment: tracker.run.environment.clone(),
                            secrets: Default::default(),
                            timeout_s: spec.timeout.map(|d| d.secs).unwrap_or(0),
                            attempt: result.attempt + 1,
                        };
                        tracing::info!(
                            "Retrying test {} of run {} (attempt {})",
                            spec.name,
                            run_id,
                            result.attempt + 1
                        );
                        let _ = crate::subsystems::session::assign_work(
                            &self.deps.sessions,
                            &agent_id,
                            retry,
                        );
                    }
                }
            }
        }
    }

    async fn handle_artifact(
        &self,
        run_id: &RunId,
        artifact: ArtifactPayload,
        active: &mut HashMap<RunId, RunTracker>,
    ) {
        let ArtifactPayload {
            name,
            content_type,
            bytes,
            test_name,
        } = artifact;

        let (storage_key, size, inline_bytes) = match bytes {
            ArtifactBytes::Inline(data) => {
                if data.len() as u64 > self.tuning.max_inline_bytes {
                    tracing::warn!(
                        "Refusing inline artifact {} for run {}: {} bytes exceeds the {} byte limit",
                        name,
                        run_id,
                        data.len(),
                        self.tuning.max_inline_bytes
                    );
                    return;
                }
                let key = format!("runs/{}/{}", run_id, name);
                match self.deps.artifacts.put(&key, &data, &content_type).await {
                    Ok(stored) => (stored, data.len() as u64, Some(data)),
                    Err(err) => {
                        tracing::error!(
                            "Artifact upload failed for run {} ({}): {}",
                            run_id,
                            name,
                            err
                        );
                        return;
                    }
                }
            }
            // the agent already uploaded through a presigned url
            ArtifactBytes::UploadRef(key) => (key, 0, None),
        };

        let reference = ArtifactRef {
            name: name.clone(),
            storage_key,
            content_type,
            size,
            test_name: test_name.clone(),
        };
        if let Err(err) = self.deps.repo.insert_artifact(run_id, reference).await {
            tracing::error!("Failed to record artifact for run {}: {}", run_id, err);
            return;
        }
        self.deps.metrics.increment_artifacts_recorded();

        // a result file shipped as an artifact is parsed into rows with the
        // format its spec declared
        let Some(inline_bytes) = inline_bytes else {
            return;
        };
        let tracker = active.get_mut(run_id).expect("tracker just ensured");
        let matching_spec = tracker
            .run
            .tests
            .iter()
            .find(|spec| {
                test_name
                    .as_deref()
                    .map(|t| t == spec.name)
                    .unwrap_or(false)
                    || spec.result_config.result_file.as_deref() == Some(name.as_str())
            })
            .cloned();

        if let Some(spec) = matching_spec {
            if spec.result_config.result_file.as_deref() == Some(name.as_str()) {
                match parsers::parse(spec.result_config.result_format, &inline_bytes) {
                    Ok(parsed) => {
                        for row in parsed {
                            let result = row.into_test_result(1);
                            self.persist_result(run_id, result, active).await;
                        }
                    }
                    Err(err) => {
                        self.deps.metrics.increment_parse_failures();
                        tracing::warn!(
                            "Failed to parse {} result file {} for run {}: {}",
                            spec.result_config.result_format,
                            name,
                            run_id,
                            err
                        );
                    }
                }
            }
        }
    }

    async fn finalize(
        &self,
        run_id: &RunId,
        active: &mut HashMap<RunId, RunTracker>,
        closed: &mut LruCache<RunId, ()>,
    ) {
        let Some(tracker) = active.remove(run_id) else {
            return;
        };
        let Some((agent_id, outcome, agent_summary, completed_at)) = tracker.complete.clone()
        else {
            // finalize without a RunComplete cannot happen from this worker
            active.insert(run_id.clone(), tracker);
            return;
        };

        // the agent's summary is authoritative; disagreement with our rows
        // is logged, not reconciled
        let row_summary = tracker.summary_from_rows();
        if row_summary != agent_summary {
            tracing::warn!(
                "Summary mismatch for run {}: agent reports {:?}, rows say {:?}",
                run_id,
                agent_summary,
                row_summary
            );
        }

        let mut status = RunStatus::from(outcome);
        if status == RunStatus::Failed && tracker.only_allowed_failures() && !tracker.latest.is_empty()
        {
            tracing::info!(
                "Run {} failed only in allow_failure tests; recording as passed",
                run_id
            );
            status = RunStatus::Passed;
        }

        match self
            .deps
            .repo
            .finalize_run(run_id, status, Some(agent_summary), completed_at)
            .await
        {
            Ok(run) => {
                self.deps.metrics.increment_runs_finalized();
                tracing::info!(
                    "Run {} finalized: status={}, total={}, passed={}, failed={}, skipped={}",
                    run_id,
                    status,
                    agent_summary.total,
                    agent_summary.passed,
                    agent_summary.failed,
                    agent_summary.skipped
                );
                self.deps.notifier.emit(Event::RunFinished {
                    run_id: run_id.clone(),
                    service_id: run.service_id.clone(),
                    status,
                    summary: agent_summary,
                    reason: None,
                });
            }
            Err(RepoError::AlreadyTerminal { status, .. }) => {
                tracing::debug!("Run {} was already finalized as {}", run_id, status);
            }
            Err(err) => {
                tracing::error!("Failed to finalize run {}: {}", run_id, err);
            }
        }

        let release_agent = tracker.run.agent_id.clone().unwrap_or(agent_id);
        match self.deps.registry.release(&release_agent, run_id).await {
            Ok(outcome) if outcome.drained => {
                self.deps
                    .sessions
                    .close(&release_agent, CloseCause::Drained);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(
                    "Failed to release agent {} after run {}: {}",
                    release_agent,
                    run_id,
                    err
                );
            }
        }
        let _ = self
            .deps
            .scheduler_tx
            .send(SchedulerCommand::CapacityFreed)
            .await;

        closed.put(run_id.clone(), ());
    }
}
