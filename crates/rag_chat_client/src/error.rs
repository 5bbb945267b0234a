//! Error types shared by the transport and the conversation layer.

use thiserror::Error;

/// Failure of a transport operation.
///
/// None of these cross the transport boundary as a panic: the persistent path
/// turns them into an `error` event, the stateless path into an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The persistent channel is not open.
    #[error("Not connected to server")]
    TransportUnavailable,
    /// The stateless endpoint could not be reached at all.
    #[error("Server unreachable: verify it is running at {endpoint}")]
    NetworkUnreachable { endpoint: String },
    /// Non-2xx HTTP status.
    #[error("Server error: {status} - {status_text}")]
    Server { status: u16, status_text: String },
    /// Payload missing expected fields or not JSON.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    /// Any other request failure; the message is passed through unchanged.
    #[error("{0}")]
    Request(String),
}

/// Why `submit_query` refused a query. Never written to the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("query is empty")]
    EmptyQuery,
    #[error("a query is already in flight")]
    QueryInFlight,
}
