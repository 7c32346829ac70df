//! Wire protocol: the server-sent-event stream delivered to the client.
//!
//! Each event is one SSE frame whose `data` field is a JSON object carrying
//! a `type` tag and the payload. Event order within a query is fixed:
//! `start` → `sources` → `context` → `chunk`* → exactly one of
//! `done`/`error`, after which the connection closes.
//!
//! ```text
//! data: {"type":"sources","sources":["vector_cache","jira"]}
//!
//! data: {"type":"chunk","text":"The fix shipped in"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::models::{Chunk, SourceId};

/// Citation entry in `context` and `done` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub source: SourceId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl DocumentRef {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            source: chunk.source,
            title: chunk.title.clone(),
            url: chunk.url.clone(),
        }
    }
}

/// One event on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Emitted immediately after the request is accepted.
    Start {},
    /// The router's selection.
    Sources { sources: Vec<SourceId> },
    /// The packed context: chunk count, contributing sources, citations.
    Context {
        count: usize,
        used_sources: Vec<SourceId>,
        documents: Vec<DocumentRef>,
    },
    /// One incremental text fragment from the model.
    Chunk { text: String },
    /// Terminal success.
    Done {
        sources: Vec<SourceId>,
        used_sources: Vec<SourceId>,
        documents: Vec<DocumentRef>,
    },
    /// Terminal failure.
    Error { message: String, kind: ErrorKind },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// Encode as one SSE frame (`data: <json>\n\n`).
    pub fn to_sse_frame(&self) -> String {
        let json = serde_json::to_string(self).expect("stream event serializes");
        format!("data: {}\n\n", json)
    }

    /// Decode the JSON payload of one SSE frame. Used by tests and the
    /// non-streaming collector.
    pub fn from_sse_frame(frame: &str) -> Option<StreamEvent> {
        let data = frame.trim().strip_prefix("data:")?.trim();
        serde_json::from_str(data).ok()
    }
}
