//! Shared harness for the integration suites: an in-memory control plane
//! plus a mock agent that speaks the real wire protocol over a duplex pipe.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use proctor::artifacts::MemoryArtifactStore;
use proctor::catalog::StaticCatalog;
use proctor::config::Config;
use proctor::notify::CollectingNotifier;
use proctor::orchestrator::{ExternalDeps, Orchestrator, RunRequest};
use proctor::subsystems::collector::NullLogFanout;
use proctor::subsystems::session::codec::{decode_frame, encode_frame, frame_codec};
use proctor_types::{
    AgentCaps, AgentId, AgentMessage, ArtifactPayload, CoreMessage, Credential, Execution,
    Heartbeat, ReportedState, ResultConfig, ResultFormat, ResultPayload, RunId, RunOutcome,
    RunSummary, Service, ServiceId, TestResult, TestSpec, Timestamp, PROTOCOL_VERSION,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use utils::context::AppContext;
use utils::storage::memory::MemoryRepository;
use utils::storage::Repository;
use utils::telemetry::noop_metrics;

pub const TEST_TOKEN: &str = "test-token";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config() -> Config {
    Config {
        auth_tokens: vec![TEST_TOKEN.to_string()],
        result_workers: 2,
        scheduler_tick: 1,
        ..Default::default()
    }
}

pub struct TestApp {
    pub ctx: AppContext,
    pub orchestrator: Arc<Orchestrator>,
    pub repo: Arc<MemoryRepository>,
    pub catalog: Arc<StaticCatalog>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub notifier: Arc<CollectingNotifier>,
    pub config: Config,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let ctx = AppContext::new();
        let repo = Arc::new(MemoryRepository::new());
        let catalog = Arc::new(StaticCatalog::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let notifier = Arc::new(CollectingNotifier::new());

        let deps = ExternalDeps {
            repo: repo.clone(),
            catalog: catalog.clone(),
            artifacts: artifacts.clone(),
            notifier: notifier.clone(),
            log_fanout: Arc::new(NullLogFanout),
        };

        let orchestrator = Arc::new(Orchestrator::new(&config, deps, noop_metrics().core));
        orchestrator.start(ctx.clone());

        Self {
            ctx,
            orchestrator,
            repo,
            catalog,
            artifacts,
            notifier,
            config,
        }
    }

    pub async fn seed_service(&self, id: &str, zones: &[&str], specs: Vec<TestSpec>) -> ServiceId {
        let service_id = ServiceId::new(id).unwrap();
        self.repo
            .upsert_service(Service {
                id: service_id.clone(),
                name: id.to_string(),
                repo: proctor_types::RepoSource {
                    clone_url: format!("https://git.example.com/{}.git", id),
                    credentials: None,
                },
                default_zones: zones
                    .iter()
                    .map(|z| z.parse().unwrap())
                    .collect::<BTreeSet<_>>(),
                default_timeout: None,
            })
            .await
            .unwrap();
        self.catalog.insert(service_id.clone(), specs);
        service_id
    }

    pub async fn submit(&self, service_id: &ServiceId, priority: i32) -> RunId {
        self.orchestrator
            .submit_run(RunRequest {
                service_id: service_id.clone(),
                git_ref: "main".to_string(),
                git_sha: "0123456789abcdef".to_string(),
                priority,
                environment: BTreeMap::new(),
            })
            .await
            .unwrap()
    }
}

pub fn spec(name: &str) -> TestSpec {
    TestSpec {
        name: name.to_string(),
        execution: Execution::Subprocess {
            command: "make".to_string(),
            args: vec!["test".to_string()],
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
        depends_on: vec![],
        exclusive: false,
        requires_services: vec![],
    }
}

pub fn exclusive_spec(name: &str) -> TestSpec {
    TestSpec {
        exclusive: true,
        ..spec(name)
    }
}

pub struct MockAgent {
    pub agent_id: AgentId,
    reader: FramedRead<ReadHalf<DuplexStream>, LengthDelimitedCodec>,
    writer: FramedWrite<WriteHalf<DuplexStream>, LengthDelimitedCodec>,
}

impl MockAgent {
    pub async fn connect(
        app: &TestApp,
        name: &str,
        zones: &[&str],
        max_parallel: u32,
    ) -> MockAgent {
        Self::connect_as(app, None, name, zones, max_parallel).await
    }

    /// Reconnect under a previously assigned id (orphan-window scenarios)
    pub async fn connect_as(
        app: &TestApp,
        agent_id: Option<AgentId>,
        name: &str,
        zones: &[&str],
        max_parallel: u32,
    ) -> MockAgent {
        Self::connect_with_buffer(app, agent_id, name, zones, max_parallel, 256 * 1024).await
    }

    /// A tiny transport buffer lets tests wedge the outbound path
    pub async fn connect_with_buffer(
        app: &TestApp,
        agent_id: Option<AgentId>,
        name: &str,
        zones: &[&str],
        max_parallel: u32,
        buffer: usize,
    ) -> MockAgent {
        let (client, server) = tokio::io::duplex(buffer);
        let orchestrator = app.orchestrator.clone();
        tokio::spawn(async move {
            let _ = orchestrator.serve_agent(server, false).await;
        });

        let (read_half, write_half) = tokio::io::split(client);
        let mut agent = MockAgent {
            agent_id: AgentId::new("placeholder").unwrap(),
            reader: FramedRead::new(read_half, frame_codec()),
            writer: FramedWrite::new(write_half, frame_codec()),
        };

        agent
            .send(AgentMessage::Register(proctor_types::RegisterRequest {
                agent_id,
                name: name.to_string(),
                version: "1.0.0".to_string(),
                caps: AgentCaps {
                    zones: zones.iter().map(|z| z.parse().unwrap()).collect(),
                    max_parallel,
                    docker_available: true,
                    ..Default::default()
                },
                protocol_version: PROTOCOL_VERSION.to_string(),
                credential: Credential::Token(TEST_TOKEN.to_string()),
            }))
            .await;

        match agent.recv().await {
            Some(CoreMessage::RegisterResponse { agent_id, .. }) => {
                agent.agent_id = agent_id;
            }
            other => panic!("expected RegisterResponse, got {:?}", other),
        }

        agent
    }

    pub async fn send(&mut self, msg: AgentMessage) {
        let frame = encode_frame(&msg).unwrap();
        self.writer.send(frame).await.unwrap();
    }

    /// A frame the codec will choke on, for violation-budget tests
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer
            .send(bytes::Bytes::copy_from_slice(bytes))
            .await
            .unwrap();
    }

    /// Next message from the core, or None after RECV_TIMEOUT
    pub async fn recv(&mut self) -> Option<CoreMessage> {
        match tokio::time::timeout(RECV_TIMEOUT, self.reader.next()).await {
            Ok(Some(Ok(frame))) => Some(decode_frame(&frame).unwrap()),
            _ => None,
        }
    }

    /// Assert nothing arrives within the given quiet period
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(Some(Ok(frame))) = tokio::time::timeout(quiet, self.reader.next()).await {
            let msg: CoreMessage = decode_frame(&frame).unwrap();
            panic!("expected silence, got {:?}", msg);
        }
    }

    pub async fn expect_assign(&mut self) -> proctor_types::AssignWork {
        match self.recv().await {
            Some(CoreMessage::AssignWork(work)) => work,
            other => panic!("expected AssignWork, got {:?}", other),
        }
    }

    pub async fn expect_cancel(&mut self) -> RunId {
        match self.recv().await {
            Some(CoreMessage::CancelWork { run_id, .. }) => run_id,
            other => panic!("expected CancelWork, got {:?}", other),
        }
    }

    pub async fn accept(&mut self, run_id: &RunId) {
        self.send(AgentMessage::WorkAccepted {
            run_id: run_id.clone(),
            accepted_at_ms: Timestamp::now().as_millis(),
        })
        .await;
    }

    pub async fn reject(&mut self, run_id: &RunId, reason: &str) {
        self.send(AgentMessage::WorkRejected {
            run_id: run_id.clone(),
            reason: reason.to_string(),
        })
        .await;
    }

    pub async fn heartbeat(&mut self, active_runs: &[&RunId]) {
        let agent_id = self.agent_id.clone();
        self.send(AgentMessage::Heartbeat(Heartbeat {
            agent_id,
            ts_ms: Timestamp::now().as_millis(),
            reported_state: if active_runs.is_empty() {
                ReportedState::Idle
            } else {
                ReportedState::Busy
            },
            active_runs: active_runs.iter().map(|r| (*r).clone()).collect(),
            usage: Default::default(),
        }))
        .await;
    }

    pub async fn stream_result(&mut self, run_id: &RunId, result: TestResult) {
        self.send(AgentMessage::Result {
            run_id: run_id.clone(),
            payload: ResultPayload::TestResult(result),
        })
        .await;
    }

    pub async fn stream_artifact(&mut self, run_id: &RunId, artifact: ArtifactPayload) {
        self.send(AgentMessage::Result {
            run_id: run_id.clone(),
            payload: ResultPayload::Artifact(artifact),
        })
        .await;
    }

    pub async fn complete(&mut self, run_id: &RunId, outcome: RunOutcome, summary: RunSummary) {
        self.send(AgentMessage::Result {
            run_id: run_id.clone(),
            payload: ResultPayload::RunComplete {
                outcome,
                summary,
                completed_at_ms: Timestamp::now().as_millis(),
            },
        })
        .await;
    }
}

/// Poll until the condition holds or the timeout elapses
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn summary(total: u32, passed: u32, failed: u32, skipped: u32) -> RunSummary {
    RunSummary {
        total,
        passed,
        failed,
        skipped,
    }
}

/// Look up a run and map it through `f`
pub async fn run_field<T>(
    repo: &Arc<MemoryRepository>,
    run_id: &RunId,
    f: impl Fn(&proctor_types::TestRun) -> T,
) -> T {
    let run = repo.get_run(run_id).await.unwrap().unwrap();
    f(&run)
}
