//! Chat client for a retrieval-augmented-generation backend.
//! A WebSocket channel with an HTTP fallback behind one event API, and the
//! conversation controller that renders it into a transcript.

pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod messages;
pub mod rag;

pub use client::{ConnectionState, Transport, TransportClient};
pub use config::{default_config_path, ChatSection, Config, ConfigError, Endpoint, ServerSection};
pub use conversation::{
    ConversationController, DeliveryStatus, Payload, Role, Route, TranscriptEntry,
};
pub use error::{SubmitError, TransportError};
pub use events::{EventBus, EventHandler, EventKind, HistoryEntry, ServerEvent};
pub use rag::{MethodConfidence, RagResult, SourceAttribution};
