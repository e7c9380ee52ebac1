use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::session::SessionRecord;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notifications a UI subscribes to for live refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HistoryEvent {
    #[serde(rename_all = "camelCase")]
    SessionStarted {
        session_id: String,
        tab_id: String,
        cwd: String,
    },
    SessionEnded {
        record: SessionRecord,
    },
    #[serde(rename_all = "camelCase")]
    SessionDeleted { session_id: String },
    #[serde(rename_all = "camelCase")]
    HistoryUpdated { session_count: usize },
}

impl HistoryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HistoryEvent::SessionStarted { .. } => "session-started",
            HistoryEvent::SessionEnded { .. } => "session-ended",
            HistoryEvent::SessionDeleted { .. } => "session-deleted",
            HistoryEvent::HistoryUpdated { .. } => "history-updated",
        }
    }
}

/// Broadcast fan-out. Emitting with no subscribers is not an error; once
/// closed every receiver sees the channel end.
#[derive(Debug)]
pub struct EventBus {
    sender: Option<broadcast::Sender<HistoryEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender: Some(sender),
        }
    }

    /// Receivers created after `close` are already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        match &self.sender {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn emit(&self, event: HistoryEvent) {
        if let Some(sender) = &self.sender {
            trace!("emitting {}", event.name());
            let _ = sender.send(event);
        }
    }

    pub fn close(&mut self) {
        self.sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
