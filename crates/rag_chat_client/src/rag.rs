//! Normalized RAG answer: what the backend returns for one query, cleaned up at
//! the transport boundary so nothing downstream sees the raw JSON shape.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::TransportError;

/// Confidence one retrieval method assigned to a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodConfidence {
    pub method: String,
    /// In `[0, 1]`. Kept exactly as received; rounding belongs to rendering.
    pub confidence: f64,
}

/// Evidence for one cited source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub source: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub methods: Vec<MethodConfidence>,
}

/// One answer from the backend.
///
/// If `error` is set, `answer` and `sources` are unreliable; use
/// [`RagResult::display_text`] rather than reading `answer` directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagResult {
    pub query: String,
    pub expanded_queries: Vec<String>,
    pub answer: String,
    /// Rank order, best first, no duplicates.
    pub sources: Vec<String>,
    pub source_attribution: Vec<SourceAttribution>,
    pub context_used: Vec<String>,
    pub error: Option<String>,
}

/// Backend document as sent. `search_results` is deliberately not modelled.
#[derive(Debug, Deserialize)]
pub(crate) struct RawRagResult {
    #[serde(default, deserialize_with = "null_as_default")]
    query: String,
    #[serde(default, deserialize_with = "null_as_default")]
    expanded_queries: Vec<String>,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    sources: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    source_attribution: Vec<SourceAttribution>,
    #[serde(default, deserialize_with = "null_as_default")]
    context_used: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

impl RawRagResult {
    pub(crate) fn normalize(self) -> Result<RagResult, TransportError> {
        let answer = match (self.answer, &self.error) {
            (Some(answer), _) => answer,
            (None, Some(_)) => String::new(),
            (None, None) => {
                return Err(TransportError::MalformedResponse(
                    "missing field `answer`".into(),
                ))
            }
        };
        Ok(RagResult {
            query: self.query,
            expanded_queries: self.expanded_queries,
            answer,
            sources: deduplicate_sources(self.sources),
            source_attribution: self.source_attribution,
            context_used: self.context_used,
            error: self.error,
        })
    }
}

/// `null` reads as the empty value, the way the backend serializes `None`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn deduplicate_sources(sources: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for source in sources {
        if seen.insert(source.clone()) {
            unique.push(source);
        }
    }
    unique
}

impl RagResult {
    /// Parse and normalize a backend JSON document.
    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        let raw: RawRagResult = serde_json::from_str(text)
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        raw.normalize()
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, TransportError> {
        let raw: RawRagResult = serde_json::from_value(value)
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        raw.normalize()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The error if there is one, otherwise the answer.
    pub fn display_text(&self) -> &str {
        self.error.as_deref().unwrap_or(&self.answer)
    }
}
