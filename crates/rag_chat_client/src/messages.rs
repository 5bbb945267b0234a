//! Wire frames for the persistent channel. Client ↔ server JSON text frames of the
//! form `{"event": "<name>", "data": {...}}`.
//!
//! These types never leave the transport: inbound frames are turned into
//! [`ServerEvent`]s by `ServerFrame::into_event`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::events::{HistoryEntry, ServerEvent};
use crate::rag::RawRagResult;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    SendQuery { query: String },
    GetConversation {},
}

/// Body of `POST /query`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest<'a> {
    pub query: &'a str,
}

/// Server → client. `data` stays raw until the event name says what it holds.
#[derive(Debug, Deserialize)]
pub(crate) struct ServerFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct SessionData {
    session_id: String,
}

#[derive(Deserialize)]
struct QueryData {
    query: String,
}

#[derive(Deserialize)]
struct ResponseData {
    response: RawRagResult,
}

#[derive(Deserialize)]
struct ErrorData {
    message: String,
}

#[derive(Deserialize)]
struct HistoryData {
    #[serde(alias = "entries")]
    conversation: Vec<HistoryEntry>,
}

fn payload<P: DeserializeOwned>(data: Value) -> Result<P, TransportError> {
    serde_json::from_value(data).map_err(|e| TransportError::MalformedResponse(e.to_string()))
}

impl ServerFrame {
    /// Fails only if the text is not an `{"event", "data"}` object.
    pub(crate) fn decode(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::MalformedResponse(e.to_string()))
    }

    pub(crate) fn event_name(&self) -> &str {
        &self.event
    }

    /// Map a frame onto the event vocabulary; `None` for event names this
    /// client does not handle. A known event whose payload does not fit, or a
    /// response that fails normalization, is reported as an `Error` event.
    pub(crate) fn into_event(self) -> Option<ServerEvent> {
        let ServerFrame { event, data } = self;
        let decoded = match event.as_str() {
            "connected" => payload(data).map(|d: SessionData| ServerEvent::Connected {
                session_id: d.session_id,
            }),
            "query_received" => {
                payload(data).map(|d: QueryData| ServerEvent::QueryReceived { query: d.query })
            }
            "query_response" => payload(data)
                .and_then(|d: ResponseData| d.response.normalize())
                .map(|response| ServerEvent::QueryResponse { response }),
            "error" => payload(data).map(|d: ErrorData| ServerEvent::Error { message: d.message }),
            "conversation_history" => {
                payload(data).map(|d: HistoryData| ServerEvent::ConversationHistory {
                    entries: d.conversation,
                })
            }
            _ => return None,
        };
        Some(decoded.unwrap_or_else(|e| ServerEvent::Error {
            message: e.to_string(),
        }))
    }
}
