use proctor_types::{AgentId, AgentState, RunId, RunStatus, RunSummary, ServiceId};
use serde::Serialize;
use tokio::sync::mpsc;

/// Events leaving the core toward notification channels (chat, email,
/// webhooks — all external collaborators).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Event {
    RunFinished {
        run_id: RunId,
        service_id: ServiceId,
        status: RunStatus,
        summary: RunSummary,
        reason: Option<String>,
    },
    AgentStatus {
        agent_id: AgentId,
        state: AgentState,
    },
}

/// Must never block its caller: the collector emits from the hot path.
pub trait NotificationSink: Send + Sync + 'static {
    fn emit(&self, event: Event);
}

/// Buffers events into a bounded channel some external sender drains.
/// When the buffer is full the event is dropped with a warning; losing a
/// notification beats stalling result collection.
#[derive(Clone)]
pub struct BufferedNotifier {
    tx: mpsc::Sender<Event>,
}

impl BufferedNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl NotificationSink for BufferedNotifier {
    fn emit(&self, event: Event) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::warn!("Dropping notification event: {}", err);
        }
    }
}

/// Swallows everything; for tools that don't notify
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn emit(&self, _event: Event) {}
}

/// Collects events in memory so tests can assert on them
#[derive(Default)]
pub struct CollectingNotifier {
    events: std::sync::Mutex<Vec<Event>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl NotificationSink for CollectingNotifier {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
