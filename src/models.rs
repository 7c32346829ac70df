//! Core data types flowing through the answering pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! Query → Router → SelectionResult → Orchestrator → Document
//!                                                      ↓
//!                                              chunk() → Chunk
//!                                                      ↓
//!                                              embed() → CacheEntry (vector cache)
//!                                                      ↓
//!                                             pack() → context → LLM → Turn
//! ```
//!
//! # Type relationships
//!
//! - A **[`Document`]** is the normalized result returned by one source for
//!   one query. The composite `(source, id)` is globally unique.
//! - A **[`Chunk`]** is a bounded slice of a document body; chunks of the same
//!   document share `doc_id` and are ordered by `ordinal`.
//! - A **[`CacheEntry`]** pairs a chunk with its embedding vector and usage
//!   metadata inside the persistent vector cache.
//! - A **[`Turn`]** is one completed user/assistant exchange in a session
//!   transcript.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed enumeration of knowledge sources. Adding a variant is a code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Confluence,
    Jira,
    Slack,
    Github,
    Google,
    Notion,
    Linear,
    Figma,
    Microsoft365,
    Devtools,
    Productivity,
    Web,
    VectorCache,
}

impl SourceId {
    /// All variants, in a stable order.
    pub const ALL: [SourceId; 13] = [
        SourceId::Confluence,
        SourceId::Jira,
        SourceId::Slack,
        SourceId::Github,
        SourceId::Google,
        SourceId::Notion,
        SourceId::Linear,
        SourceId::Figma,
        SourceId::Microsoft365,
        SourceId::Devtools,
        SourceId::Productivity,
        SourceId::Web,
        SourceId::VectorCache,
    ];

    /// Wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Confluence => "confluence",
            SourceId::Jira => "jira",
            SourceId::Slack => "slack",
            SourceId::Github => "github",
            SourceId::Google => "google",
            SourceId::Notion => "notion",
            SourceId::Linear => "linear",
            SourceId::Figma => "figma",
            SourceId::Microsoft365 => "microsoft365",
            SourceId::Devtools => "devtools",
            SourceId::Productivity => "productivity",
            SourceId::Web => "web",
            SourceId::VectorCache => "vector_cache",
        }
    }

    /// Parse a wire name back into a `SourceId`.
    pub fn parse(s: &str) -> Option<SourceId> {
        SourceId::ALL.iter().copied().find(|id| id.as_str() == s)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-query tunables, resolved from config defaults and user settings
/// before the query is accepted.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Maximum number of sources the router may select.
    pub max_sources: usize,
    /// Maximum documents requested from each source.
    pub per_source_limit: usize,
    /// Hard cap on context pack tokens.
    pub token_budget: usize,
    /// Whether the caller wants incremental token delivery.
    pub streaming: bool,
    /// Sources the user has enabled; everything else is dropped by the router.
    pub enabled_sources: BTreeSet<SourceId>,
}

/// An accepted question. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub session_id: String,
    pub user_id: String,
    /// Absolute wall-clock point past which the query must terminate.
    pub deadline: Instant,
    pub options: QueryOptions,
}

impl Query {
    /// Remaining time before the deadline, zero if already past it.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A normalized search result from one source.
///
/// `id` is stable per source (ticket key, page id, URL). `body` is plain
/// text with markup already stripped by the adapter. `score` is the source's
/// native relevance when it reports one; scales differ per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: SourceId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// A bounded slice of a document, sized for embedding and prompt inclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub source: SourceId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub text: String,
    pub token_count: usize,
    /// Zero-based position within the parent document's chunk sequence.
    pub ordinal: u32,
}

/// A chunk plus its vector and usage metadata as stored in the vector cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
    pub inserted_at: DateTime<Utc>,
    pub last_hit_at: DateTime<Utc>,
    pub hit_count: u64,
}

/// The router's decision: which sources to query, in what order.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionResult {
    pub sources: Vec<SourceId>,
    pub confidence: f32,
}

/// One completed exchange in a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub user_message: String,
    pub bot_response: String,
    /// What the router selected.
    pub sources: Vec<SourceId>,
    /// What actually contributed ≥1 chunk to the context.
    pub used_sources: Vec<SourceId>,
    pub timestamp: DateTime<Utc>,
}

/// Per-user settings blob, persisted keyed by user id.
///
/// Credentials are opaque to the core: the map values are handed verbatim to
/// the adapter for the matching source at registry construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub llm_provider: LlmProviderId,
    pub llm_model: String,
    pub llm_api_key: String,
    /// Opaque credential blobs keyed by source-specific names
    /// (`slack_bot_token`, `github_token`, `ms_tenant_id`, …).
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enable_web_search: bool,
    #[serde(default = "default_true")]
    pub use_streaming: bool,
    #[serde(default)]
    pub enabled_sources: BTreeSet<SourceId>,
}

fn default_true() -> bool {
    true
}

/// Supported language-model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderId {
    #[serde(alias = "openai_compatible")]
    Openai,
    Anthropic,
    #[serde(alias = "google_gemini", alias = "google")]
    Gemini,
    #[serde(alias = "ollama_local")]
    Ollama,
}

impl LlmProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProviderId::Openai => "openai",
            LlmProviderId::Anthropic => "anthropic",
            LlmProviderId::Gemini => "gemini",
            LlmProviderId::Ollama => "ollama",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_wire_names_roundtrip() {
        for id in SourceId::ALL {
            assert_eq!(SourceId::parse(id.as_str()), Some(id));
        }
        assert_eq!(SourceId::parse("gopher"), None);
    }

    #[test]
    fn test_source_id_serde_matches_as_str() {
        for id in SourceId::ALL {
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
        }
    }

    #[test]
    fn test_settings_provider_aliases() {
        let s: LlmProviderId = serde_json::from_str("\"openai_compatible\"").unwrap();
        assert_eq!(s, LlmProviderId::Openai);
        let s: LlmProviderId = serde_json::from_str("\"google_gemini\"").unwrap();
        assert_eq!(s, LlmProviderId::Gemini);
        let s: LlmProviderId = serde_json::from_str("\"ollama\"").unwrap();
        assert_eq!(s, LlmProviderId::Ollama);
    }

    #[test]
    fn test_query_remaining_saturates() {
        let q = Query {
            text: "x".into(),
            session_id: "s".into(),
            user_id: "u".into(),
            deadline: Instant::now()
                .checked_sub(Duration::from_millis(5))
                .unwrap_or_else(Instant::now),
            options: QueryOptions {
                max_sources: 6,
                per_source_limit: 5,
                token_budget: 4096,
                streaming: true,
                enabled_sources: BTreeSet::new(),
            },
        };
        assert_eq!(q.remaining(), Duration::ZERO);
    }
}
