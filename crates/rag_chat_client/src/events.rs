//! Typed publish/subscribe for server events.
//!
//! Every inbound push from either transport becomes exactly one [`ServerEvent`]
//! before it reaches a subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rag::RagResult;

/// One record of the server-side conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// `user` or `bot`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Query text for `user`, the full result document for `bot`.
    pub message: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Server handshake after the channel opened.
    Connected { session_id: String },
    /// Channel closed, dropped or failed to open. `None` for an explicit disconnect.
    Disconnected { reason: Option<String> },
    QueryReceived { query: String },
    QueryResponse { response: RagResult },
    Error { message: String },
    ConversationHistory { entries: Vec<HistoryEntry> },
}

/// Subscription key; one per [`ServerEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    QueryReceived,
    QueryResponse,
    Error,
    ConversationHistory,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::QueryReceived,
        EventKind::QueryResponse,
        EventKind::Error,
        EventKind::ConversationHistory,
    ];
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Connected { .. } => EventKind::Connected,
            ServerEvent::Disconnected { .. } => EventKind::Disconnected,
            ServerEvent::QueryReceived { .. } => EventKind::QueryReceived,
            ServerEvent::QueryResponse { .. } => EventKind::QueryResponse,
            ServerEvent::Error { .. } => EventKind::Error,
            ServerEvent::ConversationHistory { .. } => EventKind::ConversationHistory,
        }
    }
}

/// Subscriber callback. Identity (for unsubscribe) is the `Arc` allocation.
pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Per-kind ordered handler lists.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push(handler);
    }

    /// Removes the first registration of `handler` for `kind`. Unknown handlers are ignored.
    pub fn unsubscribe(&self, kind: EventKind, handler: &EventHandler) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = handlers.get_mut(&kind) {
            if let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, handler)) {
                list.remove(pos);
            }
        }
    }

    /// Invoke every handler registered for the event's kind, in registration order.
    ///
    /// The list is snapshotted first so handlers may (un)subscribe re-entrantly;
    /// such changes apply from the next publish on.
    pub fn publish(&self, event: &ServerEvent) {
        let snapshot: Vec<EventHandler> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.get(&event.kind()).cloned().unwrap_or_default()
        };
        debug!(kind = ?event.kind(), subscribers = snapshot.len(), "publishing event");
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<_, _> = handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}
