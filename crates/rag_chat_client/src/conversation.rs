//! Conversation controller: turns queries into transcript entries and picks a
//! transport per query.
//!
//! At most one query is in flight. Responses are matched to it by that fact
//! alone; there are no request ids, so overlapping queries are refused up front.
//!
//! Event handlers and the stateless call only post into the controller's inbox.
//! The transcript changes when the owner drains it ([`process_pending`],
//! [`next_update`], [`wait_idle`]), so all mutation happens on one task.
//!
//! [`process_pending`]: ConversationController::process_pending
//! [`next_update`]: ConversationController::next_update
//! [`wait_idle`]: ConversationController::wait_idle

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::Transport;
use crate::error::{SubmitError, TransportError};
use crate::events::{EventHandler, EventKind, HistoryEntry, ServerEvent};
use crate::rag::RagResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Answer(RagResult),
}

impl Payload {
    /// Plain text for display; answers prefer their error.
    pub fn text(&self) -> &str {
        match self {
            Payload::Text(text) => text,
            Payload::Answer(result) => result.display_text(),
        }
    }
}

/// One transcript line. Only `delivery_status` changes after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub id: String,
    pub role: Role,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub delivery_status: Option<DeliveryStatus>,
}

/// Transport a query was dispatched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Persistent,
    Stateless,
}

enum Inbound {
    Event(ServerEvent),
    Stateless(Result<RagResult, TransportError>),
}

struct InFlight {
    route: Route,
    /// Transcript index of the USER entry that started it.
    user_entry: usize,
}

pub struct ConversationController<T: Transport + 'static> {
    transport: Arc<T>,
    transcript: Vec<TranscriptEntry>,
    in_flight: Option<InFlight>,
    history: Vec<HistoryEntry>,
    handler: EventHandler,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    /// Set when `Disconnected` failed the persistent query; the send path may
    /// still report the same loss as a `TransportUnavailable` error.
    lost_on_disconnect: bool,
    next_seq: u64,
}

impl<T: Transport + 'static> ConversationController<T> {
    /// Subscribe to every event kind on `transport` with an empty transcript.
    pub fn new(transport: Arc<T>) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let forward = inbox_tx.clone();
        let handler: EventHandler = Arc::new(move |event: &ServerEvent| {
            let _ = forward.send(Inbound::Event(event.clone()));
        });
        for kind in EventKind::ALL {
            transport.subscribe(kind, handler.clone());
        }
        Self {
            transport,
            transcript: Vec::new(),
            in_flight: None,
            history: Vec::new(),
            handler,
            inbox_tx,
            inbox,
            lost_on_disconnect: false,
            next_seq: 0,
        }
    }

    /// Open the transcript with a SYSTEM welcome line.
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.push(Role::System, Payload::Text(greeting.into()), None);
        self
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_processing(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Latest `conversation_history` snapshot pushed by the server.
    pub fn server_history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn request_history(&self) {
        self.transport.request_history();
    }

    /// Append the USER entry and dispatch the query.
    ///
    /// Uses the persistent channel if it is connected right now, the stateless
    /// endpoint otherwise. Refused (with nothing recorded) if `text` is blank or
    /// a query is already in flight. Updates already in the inbox are applied
    /// first, so they can never settle the new query.
    ///
    /// # Panics
    ///
    /// The stateless path spawns onto the current Tokio runtime.
    pub fn submit_query(&mut self, text: &str) -> Result<Route, SubmitError> {
        self.process_pending();
        let query = text.trim();
        if query.is_empty() {
            return Err(SubmitError::EmptyQuery);
        }
        if self.in_flight.is_some() {
            return Err(SubmitError::QueryInFlight);
        }

        let user_entry = self.push(
            Role::User,
            Payload::Text(query.to_string()),
            Some(DeliveryStatus::Sending),
        );
        let route = if self.transport.is_connected() {
            Route::Persistent
        } else {
            Route::Stateless
        };
        self.in_flight = Some(InFlight { route, user_entry });
        self.lost_on_disconnect = false;
        debug!(?route, "dispatching query");

        match route {
            Route::Persistent => self.transport.send_persistent(query),
            Route::Stateless => {
                let transport = self.transport.clone();
                let tx = self.inbox_tx.clone();
                let query = query.to_string();
                tokio::spawn(async move {
                    let outcome = transport.send_request_response(&query).await;
                    let _ = tx.send(Inbound::Stateless(outcome));
                });
            }
        }
        Ok(route)
    }

    /// Apply everything already in the inbox. Returns how many items were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(item) = self.inbox.try_recv() {
            self.apply(item);
            applied += 1;
        }
        applied
    }

    /// Wait for the next inbound event or stateless outcome and apply it.
    pub async fn next_update(&mut self) {
        if let Some(item) = self.inbox.recv().await {
            self.apply(item);
        }
    }

    /// Apply updates until no query is in flight. There is no timeout: a hung
    /// backend keeps this pending, so wrap it if that matters.
    pub async fn wait_idle(&mut self) {
        self.process_pending();
        while self.is_processing() {
            self.next_update().await;
        }
    }

    /// Unsubscribe from the transport and drop the controller. The transport
    /// itself stays open. Dropping without calling this detaches as well.
    pub fn dispose(self) {
        self.detach();
    }

    fn detach(&self) {
        for kind in EventKind::ALL {
            self.transport.unsubscribe(kind, &self.handler);
        }
    }

    fn apply(&mut self, item: Inbound) {
        match item {
            Inbound::Event(event) => self.apply_event(event),
            Inbound::Stateless(outcome) => {
                let ours = self.route() == Some(Route::Stateless);
                if !ours {
                    warn!("stateless outcome with no stateless query in flight");
                }
                match outcome {
                    Ok(result) => {
                        if ours {
                            self.finish(DeliveryStatus::Sent);
                        }
                        self.push(Role::Assistant, Payload::Answer(result), None);
                    }
                    Err(e) => {
                        if ours {
                            self.finish(DeliveryStatus::Failed);
                        }
                        self.push_failure(format!("Error: {e}"));
                    }
                }
            }
        }
    }

    fn apply_event(&mut self, event: ServerEvent) {
        let persistent = self.route() == Some(Route::Persistent);
        match event {
            ServerEvent::Connected { session_id } => {
                self.lost_on_disconnect = false;
                self.push(
                    Role::System,
                    Payload::Text(format!("Connected to server (Session: {session_id})")),
                    None,
                );
            }
            ServerEvent::Disconnected { reason } => {
                debug!(?reason, "channel disconnected");
                if persistent {
                    self.finish(DeliveryStatus::Failed);
                    self.push_failure("Connection lost before a response arrived".to_string());
                    self.lost_on_disconnect = true;
                }
            }
            ServerEvent::QueryReceived { query } => {
                if !persistent {
                    debug!(%query, "acknowledgement with no persistent query in flight");
                    return;
                }
                self.mark_user(DeliveryStatus::Sent);
                self.push(
                    Role::System,
                    Payload::Text(format!("Query received: {query}")),
                    Some(DeliveryStatus::Sent),
                );
            }
            ServerEvent::QueryResponse { response } => {
                if persistent {
                    self.finish(DeliveryStatus::Sent);
                }
                self.push(Role::Assistant, Payload::Answer(response), None);
            }
            ServerEvent::Error { message } => {
                if self.lost_on_disconnect
                    && message == TransportError::TransportUnavailable.to_string()
                {
                    debug!("send failure for a query already lost on disconnect");
                    self.lost_on_disconnect = false;
                    return;
                }
                if persistent {
                    self.finish(DeliveryStatus::Failed);
                }
                self.push_failure(format!("Error: {message}"));
            }
            ServerEvent::ConversationHistory { entries } => {
                self.history = entries;
            }
        }
    }

    fn route(&self) -> Option<Route> {
        self.in_flight.as_ref().map(|f| f.route)
    }

    fn mark_user(&mut self, status: DeliveryStatus) {
        if let Some(flight) = &self.in_flight {
            if let Some(entry) = self.transcript.get_mut(flight.user_entry) {
                entry.delivery_status = Some(status);
            }
        }
    }

    /// Close out the in-flight query, settling its USER entry.
    fn finish(&mut self, status: DeliveryStatus) {
        self.mark_user(status);
        self.in_flight = None;
    }

    fn push_failure(&mut self, message: String) {
        self.push(
            Role::System,
            Payload::Text(message),
            Some(DeliveryStatus::Failed),
        );
    }

    fn push(
        &mut self,
        role: Role,
        payload: Payload,
        delivery_status: Option<DeliveryStatus>,
    ) -> usize {
        let created_at = Utc::now();
        self.next_seq += 1;
        self.transcript.push(TranscriptEntry {
            id: format!("{}-{}", created_at.timestamp_millis(), self.next_seq),
            role,
            payload,
            created_at,
            delivery_status,
        });
        self.transcript.len() - 1
    }
}

impl<T: Transport + 'static> Drop for ConversationController<T> {
    fn drop(&mut self) {
        self.detach();
    }
}
