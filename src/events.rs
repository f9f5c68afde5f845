//! Typed engine events over a broadcast bus.
//!
//! One event enum replaces stringly-named emitter channels: subscribers get
//! the global stream or a receiver filtered down to one session or group.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::trace;

use crate::error::EngineError;
use crate::progress::ProgressRecord;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Everything the engine reports to subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A session reported progress (also synthesized on execution timeout).
    Progress {
        session_id: String,
        group_id: Option<String>,
        record: ProgressRecord,
    },
    /// All members of a group reached a terminal status.
    GroupCompleted {
        group_id: String,
        success: bool,
        failed_sessions: Vec<String>,
    },
    /// Every non-completed member is waiting and nothing runs. Advisory.
    DeadlockSuspected {
        group_id: String,
        waiting_sessions: Vec<String>,
    },
    /// 80% of a session's execution budget is gone.
    TimeoutWarning {
        session_id: String,
        elapsed_ms: u64,
        budget_ms: u64,
    },
    /// The execution budget elapsed; the session was marked failed.
    ExecutionTimedOut {
        session_id: String,
        elapsed_ms: u64,
        threshold_ms: u64,
    },
    /// A waiting session's dependency-wait budget elapsed. Advisory; the
    /// caller may proceed without the blocking dependency.
    DependencyTimedOut {
        session_id: String,
        waited_ms: u64,
        blocked_on: Vec<String>,
    },
    /// No progress for longer than the staleness threshold. Non-fatal.
    ProgressStale {
        session_id: String,
        idle_ms: u64,
    },
    /// Shared context for a group absorbed an update (or a merged batch).
    ContextUpdated {
        group_id: String,
        contributors: Vec<String>,
        update_count: u64,
    },
    /// An isolated failure was captured without aborting siblings.
    SessionFailed {
        session_id: String,
        group_id: Option<String>,
        error: EngineError,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Progress { session_id, .. }
            | Self::TimeoutWarning { session_id, .. }
            | Self::ExecutionTimedOut { session_id, .. }
            | Self::DependencyTimedOut { session_id, .. }
            | Self::ProgressStale { session_id, .. }
            | Self::SessionFailed { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        match self {
            Self::Progress { group_id, .. } | Self::SessionFailed { group_id, .. } => {
                group_id.as_deref()
            }
            Self::GroupCompleted { group_id, .. }
            | Self::DeadlockSuspected { group_id, .. }
            | Self::ContextUpdated { group_id, .. } => Some(group_id),
            _ => None,
        }
    }
}

/// Broadcast-backed event bus shared by all engine components.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event. Nothing listening is not an error.
    pub fn emit(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            trace!("event emitted with no active subscribers");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            filter: EventFilter::All,
        }
    }

    /// Receive only events about one session.
    pub fn subscribe_session(&self, session_id: impl Into<String>) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            filter: EventFilter::Session(session_id.into()),
        }
    }

    /// Receive only events about one parallel group.
    pub fn subscribe_group(&self, group_id: impl Into<String>) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            filter: EventFilter::Group(group_id.into()),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

enum EventFilter {
    All,
    Session(String),
    Group(String),
}

impl EventFilter {
    fn matches(&self, event: &EngineEvent) -> bool {
        match self {
            Self::All => true,
            Self::Session(id) => event.session_id() == Some(id.as_str()),
            Self::Group(id) => event.group_id() == Some(id.as_str()),
        }
    }
}

/// Receiving half of a subscription. `recv` returns `None` once the bus is
/// dropped; lagged messages are skipped, not fatal.
pub struct EventReceiver {
    receiver: broadcast::Receiver<EngineEvent>,
    filter: EventFilter,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    trace!(skipped, "event receiver lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Drain without waiting; useful in tests and polling callers.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
