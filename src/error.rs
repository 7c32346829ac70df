//! Error taxonomy.
//!
//! Two layers of failure exist in this system and they propagate differently:
//!
//! - **[`FetchError`]** — a single source fetch failed. Recovered locally:
//!   logged, fed to the circuit breaker or rate gate, and the query continues
//!   with the remaining sources.
//! - **[`QueryError`]** — the query as a whole failed. Surfaced to the client
//!   as the terminal `error` event with a machine-readable [`ErrorKind`].
//!
//! Transcript persistence failures belong to neither: they are logged and
//! swallowed so they cannot corrupt an already-delivered answer.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Closed set of wire-visible failure kinds (`error.kind` on the stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An upstream rejected credentials.
    Auth,
    /// A required setting is missing; the query never reached any fetch.
    Config,
    /// No source could be admitted before the deadline and the cache was empty.
    RateLimited,
    /// The LLM stream did not begin within the first-token timeout.
    UpstreamTimeout,
    /// The LLM stream ended abnormally partway through.
    UpstreamError,
    /// The query deadline elapsed before any usable output.
    Deadline,
    /// SSE writer backpressure forced termination.
    ClientSlow,
    /// A bug; logged with detail, surfaced as a generic message.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Config => "config",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::Deadline => "deadline",
            ErrorKind::ClientSlow => "client_slow",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Terminal failure of a query, carried on the `error` event.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn deadline() -> Self {
        Self::new(ErrorKind::Deadline, "query deadline exceeded")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Failure of one source fetch. Classification decides what state it feeds.
///
/// | Variant | Breaker | RateGate |
/// |---------|---------|----------|
/// | `Timeout`, `Upstream`, `Network` | counts as failure | — |
/// | `RateLimited` | ignored (soft) | `penalize` |
/// | `Permanent` (4xx other than 429) | ignored (caller bug) | — |
/// | `Unavailable` (circuit open) | — | — |
/// | `DeadlineExceeded` | ignored (client-side) | — |
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("source timed out")]
    Timeout,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("permanent client error: {0}")]
    Permanent(String),
    #[error("circuit open")]
    Unavailable,
    #[error("deadline exceeded before admission")]
    DeadlineExceeded,
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether this failure counts toward opening the circuit.
    ///
    /// 429s drive the rate gate instead, non-429 4xx is a caller bug, and a
    /// cancellation or pre-admission deadline says nothing about the source.
    pub fn counts_for_breaker(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout | FetchError::Upstream(_) | FetchError::Network(_)
        )
    }
}
