//! Transport client: one persistent WebSocket channel plus the stateless HTTP
//! fallback, both normalized into [`ServerEvent`]s on a shared [`EventBus`].

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::Endpoint;
use crate::error::TransportError;
use crate::events::{EventBus, EventHandler, EventKind, ServerEvent};
use crate::messages::{ClientFrame, QueryRequest, ServerFrame};
use crate::rag::RagResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the conversation layer needs from a transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Point-in-time snapshot; a following `send_persistent` may still fail.
    fn is_connected(&self) -> bool;

    /// Fire-and-forget over the persistent channel. Never fails synchronously:
    /// if the channel is not open an `Error` event is published instead.
    fn send_persistent(&self, query: &str);

    /// Stateless request/response call.
    async fn send_request_response(&self, query: &str) -> Result<RagResult, TransportError>;

    /// Ask the server for its copy of the conversation. No-op when not connected.
    fn request_history(&self);

    fn subscribe(&self, kind: EventKind, handler: EventHandler);

    fn unsubscribe(&self, kind: EventKind, handler: &EventHandler);
}

/// Connection bookkeeping shared with the channel task.
#[derive(Debug)]
struct Link {
    state: ConnectionState,
    /// Bumped by every `connect`; a channel task only touches the link while
    /// its own generation is current.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Link {
    fn mark_connected(
        &mut self,
        generation: u64,
        outbound: mpsc::UnboundedSender<ClientFrame>,
    ) -> bool {
        if self.generation != generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.outbound = Some(outbound);
        true
    }

    /// Returns whether this call performed the transition (and so owns the
    /// `Disconnected` event).
    fn mark_disconnected(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.state == ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Disconnected;
        self.outbound = None;
        self.shutdown = None;
        true
    }
}

/// Owned per session; create one, hand it to a
/// [`ConversationController`](crate::conversation::ConversationController),
/// call [`disconnect`](TransportClient::disconnect) when the session ends.
#[derive(Debug)]
pub struct TransportClient {
    endpoint: Endpoint,
    http: reqwest::Client,
    bus: Arc<EventBus>,
    link: Arc<Mutex<Link>>,
}

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(|e| e.into_inner())
}

impl TransportClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            http: reqwest::Client::new(),
            bus: Arc::new(EventBus::new()),
            link: Arc::new(Mutex::new(Link {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: None,
                shutdown: None,
            })),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }

    /// Start opening the persistent channel and return immediately. The outcome
    /// is reported only through `Connected` / `Disconnected` events. Does nothing
    /// if a channel is already open or opening.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let (generation, shutdown_rx) = {
            let mut link = lock(&self.link);
            if link.state != ConnectionState::Disconnected {
                debug!(state = ?link.state, "connect ignored");
                return;
            }
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            link.generation += 1;
            link.state = ConnectionState::Connecting;
            link.shutdown = Some(shutdown_tx);
            (link.generation, shutdown_rx)
        };
        tokio::spawn(run_channel(
            self.endpoint.ws_url(),
            generation,
            self.link.clone(),
            self.bus.clone(),
            shutdown_rx,
        ));
    }

    /// Close the persistent channel. Safe to call when already disconnected.
    /// Subscriptions are kept for a later `connect`.
    pub fn disconnect(&self) {
        let shutdown = {
            let mut link = lock(&self.link);
            if link.state == ConnectionState::Disconnected {
                return;
            }
            link.state = ConnectionState::Disconnected;
            link.outbound = None;
            link.shutdown.take()
        };
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        info!(endpoint = %self.endpoint, "persistent channel closed by client");
        self.bus.publish(&ServerEvent::Disconnected { reason: None });
    }

    /// `GET /health`; any failure counts as unhealthy.
    pub async fn health_check(&self) -> bool {
        match self.http.get(self.endpoint.health_url()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }

    fn classify(&self, e: reqwest::Error) -> TransportError {
        if e.is_connect() || e.is_request() {
            warn!(endpoint = %self.endpoint, error = %e, "server unreachable");
            TransportError::NetworkUnreachable {
                endpoint: self.endpoint.to_string(),
            }
        } else {
            TransportError::Request(e.to_string())
        }
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let link = lock(&self.link);
        match (&link.outbound, link.state) {
            (Some(tx), ConnectionState::Connected) => tx
                .send(frame)
                .map_err(|_| TransportError::TransportUnavailable),
            _ => Err(TransportError::TransportUnavailable),
        }
    }
}

#[async_trait]
impl Transport for TransportClient {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn send_persistent(&self, query: &str) {
        let frame = ClientFrame::SendQuery {
            query: query.to_string(),
        };
        if let Err(e) = self.send_frame(frame) {
            debug!("send_query while channel is closed");
            self.bus.publish(&ServerEvent::Error {
                message: e.to_string(),
            });
        }
    }

    async fn send_request_response(&self, query: &str) -> Result<RagResult, TransportError> {
        let response = self
            .http
            .post(self.endpoint.query_url())
            .json(&QueryRequest { query })
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Server {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }
        let body = response.text().await.map_err(|e| self.classify(e))?;
        RagResult::from_json(&body)
    }

    fn request_history(&self) {
        if self.send_frame(ClientFrame::GetConversation {}).is_err() {
            debug!("get_conversation skipped, channel not open");
        }
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) {
        self.bus.subscribe(kind, handler);
    }

    fn unsubscribe(&self, kind: EventKind, handler: &EventHandler) {
        self.bus.unsubscribe(kind, handler);
    }
}

/// Owns one WebSocket for its lifetime. Inbound frames are published in the
/// order they arrive; the task ends on server close, error or shutdown.
/// Frames that are not `{"event", "data"}` objects and unknown event names are
/// dropped; a known event with a bad payload is published as `Error`.
async fn run_channel(
    url: String,
    generation: u64,
    link: Arc<Mutex<Link>>,
    bus: Arc<EventBus>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let handshake = tokio::select! {
        res = tokio_tungstenite::connect_async(url.as_str()) => res,
        _ = &mut shutdown => return,
    };
    let ws = match handshake {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(%url, error = %e, "persistent channel failed to open");
            if lock(&link).mark_disconnected(generation) {
                bus.publish(&ServerEvent::Disconnected {
                    reason: Some(e.to_string()),
                });
            }
            return;
        }
    };

    let (tx, mut outbound) = mpsc::unbounded_channel();
    if !lock(&link).mark_connected(generation, tx) {
        return;
    }
    info!(%url, "persistent channel open");

    let (mut sink, mut stream) = ws.split();
    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            Some(frame) = outbound.recv() => {
                let json = match serde_json::to_string(&frame) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("failed to serialize frame: {e}");
                        continue;
                    }
                };
                debug!(frame = %json, "sending frame");
                if let Err(e) = sink.send(Message::Text(json)).await {
                    break e.to_string();
                }
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                };
                let frame = match ServerFrame::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable frame");
                        continue;
                    }
                };
                let name = frame.event_name().to_string();
                match frame.into_event() {
                    Some(event) => bus.publish(&event),
                    None => debug!(event = %name, "ignoring unhandled event"),
                }
            }
        }
    };

    info!(%url, %reason, "persistent channel lost");
    if lock(&link).mark_disconnected(generation) {
        bus.publish(&ServerEvent::Disconnected {
            reason: Some(reason),
        });
    }
}
