pub mod auth;
pub mod codec;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use proctor_types::{
    AgentConfig, AgentId, AgentMessage, CoreMessage, RunId, Timestamp,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use utils::telemetry::SessionMetrics;

use crate::notify::{Event, NotificationSink};
use crate::subsystems::collector::{CollectorEvent, CollectorHandle};
use crate::subsystems::registry::{AgentRegistry, RegistryError};
use crate::subsystems::scheduler::SchedulerCommand;
use auth::{AuthError, Authenticator};
use codec::{decode_frame, encode_frame, frame_codec, CodecError};

#[derive(Debug, Clone, Copy)]
pub struct SessionTuning {
    /// Bound of the per-agent outbound dispatch queue
    pub outbound_capacity: usize,
    /// How long a fresh connection gets to present its Register frame
    pub handshake_timeout: Duration,
    /// Dropped inbound messages tolerated before the session closes
    pub violation_budget: u32,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            handshake_timeout: Duration::from_secs(10),
            violation_budget: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Outbound queue overflowed; the agent reconnects and retries
    BackpressureExceeded,
    /// Too many dropped inbound messages
    ProtocolViolations,
    /// A newer session registered under the same agent id
    Replaced,
    /// Drain finished; orderly goodbye
    Drained,
    /// The peer hung up
    PeerClosed,
    Shutdown,
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseCause::BackpressureExceeded => "backpressure exceeded",
            CloseCause::ProtocolViolations => "protocol violations",
            CloseCause::Replaced => "replaced by newer session",
            CloseCause::Drained => "drain complete",
            CloseCause::PeerClosed => "peer closed",
            CloseCause::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("handshake: {0}")]
    Handshake(String),

    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("session closed: {0}")]
    Closed(CloseCause),
}

#[derive(Error, Debug)]
pub enum SessionSendError {
    #[error("agent {0} has no open session")]
    NotConnected(AgentId),

    #[error("outbound queue for agent {0} overflowed")]
    Backpressure(AgentId),
}

struct SessionHandle {
    generation: u64,
    outbound: mpsc::Sender<CoreMessage>,
    cancel: CancellationToken,
}

/// Owns exactly one live session per connected agent and the dispatch
/// queues feeding them. Last-writer-wins: installing a session for an
/// agent id cancels whatever was there.
pub struct SessionManager {
    sessions: DashMap<AgentId, SessionHandle>,
    next_generation: AtomicU64,
    metrics: SessionMetrics,
}

impl SessionManager {
    pub fn new(metrics: SessionMetrics) -> Self {
        Self {
            sessions: DashMap::new(),
            next_generation: AtomicU64::new(1),
            metrics,
        }
    }

    fn install(
        &self,
        agent_id: AgentId,
        outbound: mpsc::Sender<CoreMessage>,
        cancel: CancellationToken,
    ) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let old = self.sessions.insert(
            agent_id.clone(),
            SessionHandle {
                generation,
                outbound,
                cancel,
            },
        );
        if let Some(old) = old {
            tracing::info!(
                "Replacing stale session for agent {}: {}",
                agent_id,
                CloseCause::Replaced
            );
            old.cancel.cancel();
        }
        self.metrics.open_sessions.add(1, &[]);
        generation
    }

    fn remove_if_current(&self, agent_id: &AgentId, generation: u64) {
        let removed = self
            .sessions
            .remove_if(agent_id, |_, handle| handle.generation == generation);
        if removed.is_some() {
            self.metrics.open_sessions.add(-1, &[]);
        }
    }

    pub fn is_connected(&self, agent_id: &AgentId) -> bool {
        self.sessions.contains_key(agent_id)
    }

    pub fn connected_agents(&self) -> Vec<AgentId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Enqueue a dispatch message. A full queue closes the session with
    /// [`CloseCause::BackpressureExceeded`] rather than blocking the caller.
    pub fn send(&self, agent_id: &AgentId, msg: CoreMessage) -> Result<(), SessionSendError> {
        let Some(handle) = self.sessions.get(agent_id) else {
            return Err(SessionSendError::NotConnected(agent_id.clone()));
        };

        match handle.outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Closing session for agent {}: {}",
                    agent_id,
                    CloseCause::BackpressureExceeded
                );
                handle.cancel.cancel();
                drop(handle);
                self.sessions.remove(agent_id);
                self.metrics.open_sessions.add(-1, &[]);
                self.metrics.increment_backpressure_closes();
                Err(SessionSendError::Backpressure(agent_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                drop(handle);
                self.sessions.remove(agent_id);
                Err(SessionSendError::NotConnected(agent_id.clone()))
            }
        }
    }

    pub fn close(&self, agent_id: &AgentId, cause: CloseCause) {
        if let Some((_, handle)) = self.sessions.remove(agent_id) {
            tracing::info!("Closing session for agent {}: {}", agent_id, cause);
            handle.cancel.cancel();
            self.metrics.open_sessions.add(-1, &[]);
        }
    }

    /// Broadcast a drain request to every live session
    pub fn drain_all(&self, drain_id: &proctor_types::DrainId) {
        for agent_id in self.connected_agents() {
            let _ = self.send(
                &agent_id,
                CoreMessage::Drain {
                    drain_id: drain_id.clone(),
                },
            );
        }
    }
}

/// Per-connection protocol driver: performs the register handshake, then
/// runs the reader half, forwarding each inbound message to its consumer.
/// A writer task drains the outbound queue concurrently; the two halves
/// are independent.
pub struct SessionRouter {
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionManager>,
    collector: CollectorHandle,
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
    authenticator: Authenticator,
    notifier: Arc<dyn NotificationSink>,
    agent_config: AgentConfig,
    tuning: SessionTuning,
    metrics: SessionMetrics,
}

impl SessionRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionManager>,
        collector: CollectorHandle,
        scheduler_tx: mpsc::Sender<SchedulerCommand>,
        authenticator: Authenticator,
        notifier: Arc<dyn NotificationSink>,
        agent_config: AgentConfig,
        tuning: SessionTuning,
        metrics: SessionMetrics,
    ) -> Self {
        Self {
            registry,
            sessions,
            collector,
            scheduler_tx,
            authenticator,
            notifier,
            agent_config,
            tuning,
            metrics,
        }
    }

    /// Drive one agent connection to completion. `transport_authenticated`
    /// is true when the TLS layer verified a client certificate.
    #[instrument(skip(self, io), fields(subsys = "Session"))]
    pub async fn serve<T>(&self, io: T, transport_authenticated: bool) -> Result<(), SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mut reader = FramedRead::new(read_half, frame_codec());
        let mut writer = FramedWrite::new(write_half, frame_codec());

        // handshake: first frame must be Register, inside the timeout,
        // authenticated before the registry is touched
        let frame = tokio::time::timeout(self.tuning.handshake_timeout, reader.next())
            .await
            .map_err(|_| SessionError::Handshake("timed out waiting for register".to_string()))?
            .ok_or_else(|| SessionError::Handshake("closed before register".to_string()))?
            .map_err(SessionError::Io)?;

        let msg: AgentMessage = decode_frame(&frame)?;
        let AgentMessage::Register(req) = msg else {
            return Err(SessionError::Handshake(
                "first message was not register".to_string(),
            ));
        };

        self.authenticator
            .authenticate(&req.credential, transport_authenticated)?;

        if !proctor_types::protocol_compatible(&req.protocol_version) {
            return Err(SessionError::Handshake(format!(
                "incompatible protocol version {}",
                req.protocol_version
            )));
        }

        let agent = self.registry.register(&req).await?;
        let agent_id = agent.id.clone();

        let (outbound_tx, outbound_rx) = mpsc::channel(self.tuning.outbound_capacity);
        let cancel = CancellationToken::new();
        let generation = self
            .sessions
            .install(agent_id.clone(), outbound_tx.clone(), cancel.clone());

        writer
            .send(encode_frame(&CoreMessage::RegisterResponse {
                agent_id: agent_id.clone(),
                config: self.agent_config,
            })?)
            .await?;
        self.metrics.increment_messages_out();

        self.notifier.emit(Event::AgentStatus {
            agent_id: agent_id.clone(),
            state: agent.state,
        });

        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            cancel.clone(),
            self.metrics.clone(),
        ));

        let result = self
            .read_loop(&mut reader, &agent_id, &outbound_tx, &cancel)
            .await;

        self.sessions.remove_if_current(&agent_id, generation);
        cancel.cancel();
        let _ = writer_task.await;

        match result {
            // orderly closes are not errors
            Ok(()) | Err(SessionError::Closed(CloseCause::Drained)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn read_loop<R>(
        &self,
        reader: &mut FramedRead<ReadHalf<R>, tokio_util::codec::LengthDelimitedCodec>,
        agent_id: &AgentId,
        outbound: &mpsc::Sender<CoreMessage>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + AsyncWrite + Send,
    {
        let mut violations: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = reader.next() => {
                    let frame = match frame {
                        None => return Ok(()),
                        Some(Err(err)) => return Err(SessionError::Io(err)),
                        Some(Ok(frame)) => frame,
                    };
                    self.metrics.increment_messages_in();

                    let msg: AgentMessage = match decode_frame(&frame) {
                        Ok(msg) => msg,
                        Err(err) => {
                            tracing::warn!("Undecodable frame from agent {}: {}", agent_id, err);
                            violations += 1;
                            self.metrics.increment_protocol_violations();
                            if violations >= self.tuning.violation_budget {
                                return Err(SessionError::Closed(CloseCause::ProtocolViolations));
                            }
                            continue;
                        }
                    };

                    match self.route(agent_id, outbound, msg).await? {
                        Routed::Ok => {}
                        Routed::Violation(why) => {
                            tracing::warn!("Dropping message from agent {}: {}", agent_id, why);
                            violations += 1;
                            self.metrics.increment_protocol_violations();
                            if violations >= self.tuning.violation_budget {
                                return Err(SessionError::Closed(CloseCause::ProtocolViolations));
                            }
                        }
                        Routed::Close(cause) => {
                            return Err(SessionError::Closed(cause));
                        }
                    }
                }
            }
        }
    }

    async fn route(
        &self,
        agent_id: &AgentId,
        outbound: &mpsc::Sender<CoreMessage>,
        msg: AgentMessage,
    ) -> Result<Routed, SessionError> {
        match msg {
            AgentMessage::Register(_) => {
                Ok(Routed::Violation("register on an open session".to_string()))
            }

            AgentMessage::Heartbeat(hb) => {
                if hb.agent_id != *agent_id {
                    return Ok(Routed::Violation(format!(
                        "heartbeat for foreign agent {}",
                        hb.agent_id
                    )));
                }
                let outcome = self.registry.heartbeat(&hb).await?;
                // stale dispatches on the agent side get a cancel each
                for run_id in outcome.unknown_runs {
                    let _ = outbound
                        .send(CoreMessage::CancelWork {
                            run_id,
                            reason: "unknown run".to_string(),
                        })
                        .await;
                }
                Ok(Routed::Ok)
            }

            AgentMessage::WorkAccepted {
                run_id,
                accepted_at_ms,
            } => {
                let _ = self
                    .scheduler_tx
                    .send(SchedulerCommand::WorkAccepted {
                        agent_id: agent_id.clone(),
                        run_id,
                        accepted_at: Timestamp::from_millis(accepted_at_ms),
                    })
                    .await;
                Ok(Routed::Ok)
            }

            AgentMessage::WorkRejected { run_id, reason } => {
                let _ = self
                    .scheduler_tx
                    .send(SchedulerCommand::WorkRejected {
                        agent_id: agent_id.clone(),
                        run_id,
                        reason,
                    })
                    .await;
                Ok(Routed::Ok)
            }

            AgentMessage::Result { run_id, payload } => {
                self.collector
                    .dispatch(CollectorEvent {
                        agent_id: agent_id.clone(),
                        run_id,
                        payload,
                    })
                    .await;
                Ok(Routed::Ok)
            }

            AgentMessage::DrainComplete { drain_id } => {
                tracing::info!("Agent {} completed drain {}", agent_id, drain_id);
                self.registry.drain_complete(agent_id).await?;
                self.notifier.emit(Event::AgentStatus {
                    agent_id: agent_id.clone(),
                    state: proctor_types::AgentState::Offline,
                });
                Ok(Routed::Close(CloseCause::Drained))
            }
        }
    }
}

enum Routed {
    Ok,
    Violation(String),
    Close(CloseCause),
}

async fn write_loop<W>(
    mut writer: FramedWrite<WriteHalf<W>, tokio_util::codec::LengthDelimitedCodec>,
    mut outbound: mpsc::Receiver<CoreMessage>,
    cancel: CancellationToken,
    metrics: SessionMetrics,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    'outer: loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outbound.recv() => match msg {
                None => break,
                Some(msg) => msg,
            },
        };

        let frame = match encode_frame(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!("Failed to encode outbound message: {}", err);
                continue;
            }
        };

        // a wedged peer must not pin this task past cancellation
        tokio::select! {
            _ = cancel.cancelled() => break 'outer,
            result = writer.send(frame) => {
                if let Err(err) = result {
                    tracing::debug!("Outbound write failed, session is gone: {}", err);
                    break 'outer;
                }
                metrics.increment_messages_out();
            }
        }
    }

    let _ = writer.close().await;
}

/// Used by the scheduler to hand work to a session; kept here so the
/// scheduler never touches framing.
pub fn assign_work(
    sessions: &SessionManager,
    agent_id: &AgentId,
    work: proctor_types::AssignWork,
) -> Result<(), SessionSendError> {
    sessions.send(agent_id, CoreMessage::AssignWork(work))
}

/// Cancel a run on whichever session currently serves the agent
pub fn cancel_work(
    sessions: &SessionManager,
    agent_id: &AgentId,
    run_id: &RunId,
    reason: &str,
) -> Result<(), SessionSendError> {
    sessions.send(
        agent_id,
        CoreMessage::CancelWork {
            run_id: run_id.clone(),
            reason: reason.to_string(),
        },
    )
}
