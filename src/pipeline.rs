//! End-to-end query pipeline.
//!
//! [`run_query`] accepts a [`Query`] plus the user's [`Settings`] and drives
//! routing, fan-out, context assembly, and generation, writing
//! [`StreamEvent`]s to the caller's channel. Event discipline:
//!
//! - `start` → `sources` → `context` → `chunk`* → exactly one terminal
//!   `done`/`error`;
//! - the transcript is persisted only after a complete answer, best-effort —
//!   a store failure never turns a delivered answer into an error;
//! - closing the event channel (client disconnect) cancels the query token,
//!   which aborts in-flight fetches and the LLM stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::Core;
use crate::error::{ErrorKind, FetchError, QueryError};
use crate::llm::{self, ChatMessage, GenParams, LlmError, LlmStreamer};
use crate::models::{Query, Settings, SourceId, Turn};
use crate::orchestrator::Orchestrator;
use crate::protocol::{DocumentRef, StreamEvent};
use crate::source::SourceRegistry;

/// How long the event writer may stall before the query is dropped as
/// `client_slow`. The token channel itself is the backpressure buffer.
const WRITER_STALL: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = "You are an assistant with access to organizational \
knowledge: documentation wikis, issue trackers, chat archives, code hosts, and \
web search. Base answers strictly on the retrieved context below; if it is \
insufficient, say so plainly. Cite sources by title and URL when available, \
use markdown structure, and keep a concise professional tone.";

/// Everything the non-streaming endpoint needs from a finished query.
#[derive(Debug, Default)]
pub struct QueryOutcome {
    pub response: String,
    pub sources: Vec<SourceId>,
    pub used_sources: Vec<SourceId>,
    pub documents: Vec<DocumentRef>,
}

/// Drive one query to completion, emitting events on `events`.
///
/// Exactly one terminal event is emitted unless the receiver disappears
/// first, in which case the query is cancelled and nothing further is
/// written.
pub async fn run_query(
    core: &Arc<Core>,
    query: Query,
    settings: Settings,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    let registry = Arc::new(SourceRegistry::from_config(&core.config, &settings));
    let streamer = llm::create_streamer(settings.llm_provider);
    run_query_with(core, query, settings, registry, streamer, events, cancel).await;
}

/// [`run_query`] with the registry and streamer supplied by the caller.
/// The production entry point builds both from config and settings; tests
/// substitute in-process fakes.
#[allow(clippy::too_many_arguments)]
pub async fn run_query_with(
    core: &Arc<Core>,
    query: Query,
    settings: Settings,
    registry: Arc<SourceRegistry>,
    streamer: Box<dyn LlmStreamer>,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    let emitter = Emitter {
        events,
        cancel: cancel.clone(),
    };

    match drive(core, &query, &settings, registry, streamer.as_ref(), &emitter, &cancel).await {
        Ok(outcome) => {
            info!(
                session = %query.session_id,
                used_sources = ?outcome.used_sources,
                chars = outcome.response.len(),
                "query complete"
            );
        }
        Err(e) => {
            warn!(session = %query.session_id, kind = ?e.kind, error = %e.message, "query failed");
            let message = match e.kind {
                // Internal detail stays in the logs.
                ErrorKind::Internal => "internal error".to_string(),
                _ => e.message.clone(),
            };
            emitter
                .send(StreamEvent::Error {
                    message,
                    kind: e.kind,
                })
                .await;
        }
    }
    cancel.cancel();
}

/// Run the pipeline and collect the final answer, for `POST /chat` and the
/// one-shot CLI. Streams internally, discards nothing.
pub async fn run_query_collected(
    core: &Arc<Core>,
    query: Query,
    settings: Settings,
) -> Result<QueryOutcome, QueryError> {
    let (tx, mut rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let core = Arc::clone(core);
    let handle = tokio::spawn(async move {
        run_query(&core, query, settings, tx, cancel).await;
    });

    let mut outcome = QueryOutcome::default();
    let mut terminal: Option<Result<(), QueryError>> = None;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Sources { sources } => outcome.sources = sources,
            StreamEvent::Context {
                used_sources,
                documents,
                ..
            } => {
                outcome.used_sources = used_sources;
                outcome.documents = documents;
            }
            StreamEvent::Chunk { text } => outcome.response.push_str(&text),
            StreamEvent::Done {
                used_sources,
                documents,
                ..
            } => {
                outcome.used_sources = used_sources;
                outcome.documents = documents;
                terminal = Some(Ok(()));
            }
            StreamEvent::Error { message, kind } => {
                terminal = Some(Err(QueryError::new(kind, message)));
            }
            StreamEvent::Start {} => {}
        }
    }
    let _ = handle.await;

    match terminal {
        Some(Ok(())) => Ok(outcome),
        Some(Err(e)) => Err(e),
        None => Err(QueryError::internal("stream ended without terminal event")),
    }
}

struct Emitter {
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    /// Write one event. A closed receiver means the client is gone: cancel
    /// the query. A stalled receiver past [`WRITER_STALL`] is `client_slow`.
    async fn send(&self, event: StreamEvent) -> bool {
        match self.events.send_timeout(event, WRITER_STALL).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!("event writer stalled, dropping query");
                self.cancel.cancel();
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.cancel.cancel();
                false
            }
        }
    }
}

async fn drive(
    core: &Arc<Core>,
    query: &Query,
    settings: &Settings,
    registry: Arc<SourceRegistry>,
    streamer: &dyn LlmStreamer,
    emitter: &Emitter,
    cancel: &CancellationToken,
) -> Result<QueryOutcome, QueryError> {
    if settings.llm_api_key.is_empty() && !matches!(settings.llm_provider, crate::models::LlmProviderId::Ollama) {
        return Err(QueryError::config("LLM API key is not configured"));
    }

    if !emitter.send(StreamEvent::Start {}).await {
        return Err(QueryError::new(ErrorKind::ClientSlow, "client gone before start"));
    }

    let unavailable = core.unavailable_sources(&registry.ids());
    let selection = core.router.select(
        &query.text,
        &query.options,
        &unavailable,
        !core.cache.is_empty(),
        settings.enable_web_search,
    );
    info!(sources = ?selection.sources, confidence = selection.confidence, "sources selected");

    if !emitter
        .send(StreamEvent::Sources {
            sources: selection.sources.clone(),
        })
        .await
    {
        return Err(QueryError::new(ErrorKind::ClientSlow, "client gone at sources"));
    }

    // Fan-out and aggregation.
    let orchestrator = Orchestrator::new(
        &core.config,
        Arc::clone(&core.rategate),
        Arc::clone(&core.breaker),
        Arc::clone(&registry),
        Arc::clone(&core.cache),
        Arc::clone(&core.embedder),
    );
    let aggregation = orchestrator.run(query, &selection, cancel).await;

    // Terminal rate-limit case: the only selected source could not be
    // admitted and the cache had nothing.
    let external_reports: Vec<&crate::orchestrator::SearchReport> = aggregation
        .reports
        .iter()
        .filter(|r| r.source != SourceId::VectorCache)
        .collect();
    let all_rate_limited = !external_reports.is_empty()
        && external_reports.iter().all(|r| {
            matches!(
                r.result,
                Err(FetchError::RateLimited { .. }) | Err(FetchError::DeadlineExceeded)
            )
        });
    if all_rate_limited && external_reports.len() == 1 && aggregation.cache_hits.is_empty() {
        return Err(QueryError::new(
            ErrorKind::RateLimited,
            "the selected source could not be admitted before the deadline",
        ));
    }

    // Context assembly.
    let pack = core
        .context_builder()
        .build(
            &query.text,
            &aggregation.fetched,
            aggregation.cache_hits,
            query.options.token_budget,
        )
        .await
        .map_err(|e| QueryError::internal(format!("context assembly failed: {}", e)))?;

    let documents: Vec<DocumentRef> = pack.documents().into_iter().map(DocumentRef::from_chunk).collect();
    if !emitter
        .send(StreamEvent::Context {
            count: pack.chunks.len(),
            used_sources: pack.used_sources.clone(),
            documents: documents.clone(),
        })
        .await
    {
        return Err(QueryError::new(ErrorKind::ClientSlow, "client gone at context"));
    }

    // The deadline gates generation start; an exhausted deadline with no
    // usable context is terminal.
    if query.remaining().is_zero() && pack.chunks.is_empty() {
        return Err(QueryError::deadline());
    }

    // Prompt construction.
    let history = core
        .store
        .recent_turns(&query.session_id, core.config.query.history_turns)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "history fetch failed, continuing without");
            Vec::new()
        });
    let messages = build_messages(&query.text, &pack.render(), &history);

    // Generation.
    let params = GenParams::from_settings(settings, core.config.llm.token_channel_cap);
    let response = stream_answer(core, streamer, messages, &params, emitter, cancel).await?;

    // Persist the completed turn, best-effort.
    let turn = Turn {
        user_message: query.text.clone(),
        bot_response: response.clone(),
        sources: selection.sources.clone(),
        used_sources: pack.used_sources.clone(),
        timestamp: Utc::now(),
    };
    if let Err(e) = core.store.append_turn(&query.session_id, &turn).await {
        error!(error = %e, "transcript persist failed (answer already delivered)");
    }

    let outcome = QueryOutcome {
        response,
        sources: selection.sources.clone(),
        used_sources: pack.used_sources.clone(),
        documents: documents.clone(),
    };
    emitter
        .send(StreamEvent::Done {
            sources: outcome.sources.clone(),
            used_sources: outcome.used_sources.clone(),
            documents,
        })
        .await;
    Ok(outcome)
}

/// `[system + context, history turns, user question]`.
fn build_messages(question: &str, context_block: &str, history: &[Turn]) -> Vec<ChatMessage> {
    let system = if context_block.is_empty() {
        SYSTEM_PROMPT.to_string()
    } else {
        format!("{}\n\nRetrieved context:\n\n{}", SYSTEM_PROMPT, context_block)
    };

    let mut messages = vec![ChatMessage::system(system)];
    for turn in history {
        messages.push(ChatMessage::user(&turn.user_message));
        messages.push(ChatMessage::assistant(&turn.bot_response));
    }
    messages.push(ChatMessage::user(question));
    messages
}

/// Forward the LLM fragment stream as `chunk` events, enforcing the
/// first-token timeout, and return the accumulated answer.
async fn stream_answer(
    core: &Arc<Core>,
    streamer: &dyn LlmStreamer,
    messages: Vec<ChatMessage>,
    params: &GenParams,
    emitter: &Emitter,
    cancel: &CancellationToken,
) -> Result<String, QueryError> {
    let mut rx = streamer
        .stream(messages, params, cancel.clone())
        .await
        .map_err(map_llm_error)?;

    let mut response = String::new();
    let mut first = true;
    loop {
        let received = if first {
            match tokio::time::timeout(core.config.first_token_timeout(), rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    cancel.cancel();
                    return Err(QueryError::new(
                        ErrorKind::UpstreamTimeout,
                        "model produced no output within the first-token timeout",
                    ));
                }
            }
        } else {
            rx.recv().await
        };

        match received {
            Some(Ok(text)) => {
                first = false;
                response.push_str(&text);
                if !emitter.send(StreamEvent::Chunk { text }).await {
                    return Err(QueryError::new(ErrorKind::ClientSlow, "client gone mid-stream"));
                }
            }
            Some(Err(e)) => return Err(map_llm_error(e)),
            None => break,
        }
    }
    Ok(response)
}

fn map_llm_error(e: LlmError) -> QueryError {
    let kind = match &e {
        LlmError::Auth => ErrorKind::Auth,
        LlmError::RateLimited => ErrorKind::RateLimited,
        LlmError::BadRequest(_) => ErrorKind::Internal,
        LlmError::UpstreamTimeout => ErrorKind::UpstreamTimeout,
        LlmError::Upstream(_) => ErrorKind::UpstreamError,
    };
    QueryError::new(kind, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_messages_shape() {
        let history = vec![Turn {
            user_message: "earlier question".to_string(),
            bot_response: "earlier answer".to_string(),
            sources: vec![],
            used_sources: vec![],
            timestamp: Utc::now(),
        }];
        let messages = build_messages("current question", "Source: jira\nbody", &history);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("Retrieved context"));
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3].role, "user");
        assert_eq!(messages[3].content, "current question");
    }

    #[test]
    fn test_build_messages_without_context() {
        let messages = build_messages("q", "", &[]);
        assert_eq!(messages.len(), 2);
        assert!(!messages[0].content.contains("Retrieved context"));
    }

    #[test]
    fn test_llm_error_mapping() {
        assert_eq!(map_llm_error(LlmError::Auth).kind, ErrorKind::Auth);
        assert_eq!(
            map_llm_error(LlmError::RateLimited).kind,
            ErrorKind::RateLimited
        );
        assert_eq!(
            map_llm_error(LlmError::UpstreamTimeout).kind,
            ErrorKind::UpstreamTimeout
        );
        assert_eq!(
            map_llm_error(LlmError::Upstream("boom".into())).kind,
            ErrorKind::UpstreamError
        );
        assert_eq!(
            map_llm_error(LlmError::BadRequest("x".into())).kind,
            ErrorKind::Internal
        );
    }
}
