//! End-to-end pipeline scenarios with in-process source adapters and a
//! scripted model streamer.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use askgate::config::Config;
use askgate::core::Core;
use askgate::error::{ErrorKind, FetchError};
use askgate::llm::{ChatMessage, GenParams, LlmError, LlmStreamer, TokenRx};
use askgate::models::{Document, LlmProviderId, Query, Settings, SourceId};
use askgate::pipeline::run_query_with;
use askgate::protocol::StreamEvent;
use askgate::source::{SourceAdapter, SourceRegistry};

// ============ fixtures ============

struct MockAdapter {
    id: SourceId,
    documents: Vec<Document>,
    delay: Duration,
    fail_with: Option<FetchError>,
    calls: Arc<AtomicUsize>,
}

impl MockAdapter {
    fn ok(id: SourceId, documents: Vec<Document>) -> Self {
        Self {
            id,
            documents,
            delay: Duration::ZERO,
            fail_with: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(id: SourceId, error: FetchError, delay: Duration) -> Self {
        Self {
            id,
            documents: Vec::new(),
            delay,
            fail_with: Some(error),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn slow(id: SourceId, documents: Vec<Document>, delay: Duration) -> Self {
        Self {
            id,
            documents,
            delay,
            fail_with: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn search(
        &self,
        _query: &str,
        limit: usize,
        _timeout: Duration,
    ) -> Result<Vec<Document>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(self.documents.iter().take(limit).cloned().collect()),
        }
    }

    async fn healthy(&self) -> bool {
        true
    }
}

struct MockStreamer {
    fragments: Vec<Result<String, LlmError>>,
    delay: Duration,
    cancelled: Arc<AtomicBool>,
}

impl MockStreamer {
    fn answering(text_fragments: &[&str]) -> Self {
        Self {
            fragments: text_fragments.iter().map(|f| Ok(f.to_string())).collect(),
            delay: Duration::ZERO,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn failing_after(text_fragments: &[&str], error: LlmError) -> Self {
        let mut fragments: Vec<Result<String, LlmError>> =
            text_fragments.iter().map(|f| Ok(f.to_string())).collect();
        fragments.push(Err(error));
        Self {
            fragments,
            delay: Duration::ZERO,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn slow(text_fragments: &[&str], delay: Duration) -> Self {
        Self {
            fragments: text_fragments.iter().map(|f| Ok(f.to_string())).collect(),
            delay,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl LlmStreamer for MockStreamer {
    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
        params: &GenParams,
        cancel: CancellationToken,
    ) -> Result<TokenRx, LlmError> {
        let (tx, rx) = mpsc::channel(params.channel_cap);
        let fragments = self.fragments.clone();
        let delay = self.delay;
        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            for fragment in fragments {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            cancelled.store(true, Ordering::SeqCst);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    cancelled.store(true, Ordering::SeqCst);
                    return;
                }
                if tx.send(fragment).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn probe(&self, _params: &GenParams) -> Result<(), LlmError> {
        Ok(())
    }
}

fn document(source: SourceId, id: &str, title: &str, body: &str) -> Document {
    Document {
        id: id.to_string(),
        source,
        title: title.to_string(),
        url: Some(format!("https://example.test/{}", id)),
        body: body.to_string(),
        fetched_at: Utc::now(),
        score: None,
    }
}

fn settings(enabled: &[SourceId]) -> Settings {
    Settings {
        llm_provider: LlmProviderId::Openai,
        llm_model: "test-model".to_string(),
        llm_api_key: "test-key".to_string(),
        credentials: Default::default(),
        enable_web_search: true,
        use_streaming: true,
        enabled_sources: enabled.iter().copied().collect::<BTreeSet<_>>(),
    }
}

async fn test_core(tweak: impl FnOnce(&mut Config)) -> (Arc<Core>, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.store.url = dir.path().join("store.sqlite").display().to_string();
    config.cache.dir = dir.path().join("vectors");
    config.query.deadline_ms = 5_000;
    tweak(&mut config);
    let core = Core::init(config).await.unwrap();
    (Arc::new(core), dir)
}

fn query_for(core: &Core, text: &str, settings: &Settings) -> Query {
    Query {
        text: text.to_string(),
        session_id: "s-test".to_string(),
        user_id: "u-test".to_string(),
        deadline: Instant::now() + core.config.query_deadline(),
        options: core.query_options(settings),
    }
}

/// Run a query against mock collaborators and return every emitted event.
async fn run_and_collect(
    core: &Arc<Core>,
    query: Query,
    settings: Settings,
    registry: SourceRegistry,
    streamer: MockStreamer,
) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    let core = Arc::clone(core);
    let handle = tokio::spawn(async move {
        run_query_with(
            &core,
            query,
            settings,
            Arc::new(registry),
            Box::new(streamer),
            tx,
            CancellationToken::new(),
        )
        .await;
    });

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    handle.await.unwrap();
    events
}

fn terminal_count(events: &[StreamEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

fn chunk_texts(events: &[StreamEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

async fn seed_cache(core: &Arc<Core>, source: SourceId, doc_id: &str, text: &str) {
    let doc = document(source, doc_id, &format!("{} title", doc_id), text);
    let chunks = core.context_builder().chunk_documents(&[doc]);
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = core.embedder.embed_batch(&texts).await.unwrap();
    core.cache.insert(&chunks, &embeddings).await.unwrap();
}

// ============ scenarios ============

#[tokio::test]
async fn jira_only_keyword_routing() {
    let (core, _dir) = test_core(|_| {}).await;
    // A populated but irrelevant cache: selected, contributes nothing.
    seed_cache(&core, SourceId::Confluence, "misc", "quarterly zebra budget marmalade").await;

    let body = "login fails with a 500 after the session cookie expires ".repeat(50);
    let mut registry = SourceRegistry::empty();
    registry.register(Arc::new(MockAdapter::ok(
        SourceId::Jira,
        vec![document(SourceId::Jira, "CTT-21761", "CTT-21761 Login bug", &body)],
    )));

    let s = settings(&[SourceId::Jira, SourceId::VectorCache, SourceId::Web]);
    let q = query_for(&core, "What is the status of CTT-21761?", &s);
    let events = run_and_collect(&core, q, s, registry, MockStreamer::answering(&["The fix ", "shipped."])).await;

    assert!(matches!(events[0], StreamEvent::Start {}));
    let StreamEvent::Sources { sources } = &events[1] else {
        panic!("expected sources event, got {:?}", events[1]);
    };
    assert_eq!(sources, &vec![SourceId::VectorCache, SourceId::Jira]);

    let context = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::Context {
                count,
                used_sources,
                documents,
            } => Some((*count, used_sources.clone(), documents.clone())),
            _ => None,
        })
        .expect("context event");
    assert!(context.0 >= 1);
    assert_eq!(context.1, vec![SourceId::Jira]);
    assert_eq!(context.2[0].source, SourceId::Jira);
    assert_eq!(context.2[0].title, "CTT-21761 Login bug");

    assert!(!chunk_texts(&events).is_empty());
    let StreamEvent::Done { used_sources, .. } = events.last().unwrap() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert_eq!(used_sources, &vec![SourceId::Jira]);
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn cache_hit_is_additive_and_ranks_first() {
    let (core, _dir) = test_core(|c| {
        c.cache.min_score = 0.05;
    })
    .await;
    seed_cache(
        &core,
        SourceId::Confluence,
        "deploy-page",
        "deployment process: how to deploy to production with the release pipeline",
    )
    .await;

    let confluence = MockAdapter::ok(
        SourceId::Confluence,
        vec![document(
            SourceId::Confluence,
            "unrelated",
            "Unrelated page",
            "holiday rota spreadsheet ownership notes",
        )],
    );
    let confluence_calls = Arc::clone(&confluence.calls);
    let mut registry = SourceRegistry::empty();
    registry.register(Arc::new(confluence));

    let s = settings(&[SourceId::Confluence, SourceId::VectorCache]);
    let q = query_for(&core, "How do I deploy to production? (wiki)", &s);
    let events =
        run_and_collect(&core, q, s, registry, MockStreamer::answering(&["Use the pipeline."])).await;

    // The external adapter is still called: the cache is additive.
    assert_eq!(confluence_calls.load(Ordering::SeqCst), 1);

    let StreamEvent::Context { documents, used_sources, .. } = events
        .iter()
        .find(|e| matches!(e, StreamEvent::Context { .. }))
        .unwrap()
    else {
        unreachable!()
    };
    assert_eq!(documents[0].source, SourceId::VectorCache);
    assert!(used_sources.contains(&SourceId::VectorCache));
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn one_source_fails_others_succeed() {
    let (core, _dir) = test_core(|_| {}).await;

    let mut registry = SourceRegistry::empty();
    registry.register(Arc::new(MockAdapter::ok(
        SourceId::Jira,
        vec![document(SourceId::Jira, "J-1", "Sprint bug", "the sprint bug ticket body")],
    )));
    registry.register(Arc::new(MockAdapter::ok(
        SourceId::Confluence,
        vec![document(SourceId::Confluence, "C-1", "Sprint wiki", "the sprint documentation page")],
    )));
    registry.register(Arc::new(MockAdapter::failing(
        SourceId::Slack,
        FetchError::Upstream("boom".to_string()),
        Duration::from_millis(50),
    )));

    let s = settings(&[SourceId::Jira, SourceId::Confluence, SourceId::Slack]);
    let q = query_for(&core, "sprint bug ticket discussed in the slack channel wiki page", &s);
    let events =
        run_and_collect(&core, q, s, registry, MockStreamer::answering(&["All good."])).await;

    let StreamEvent::Done { used_sources, .. } = events.last().unwrap() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert!(used_sources.contains(&SourceId::Jira));
    assert!(!used_sources.contains(&SourceId::Slack));
    assert_eq!(terminal_count(&events), 1);

    // One failure is below the breaker threshold: still closed.
    assert_eq!(
        core.breaker.state(SourceId::Slack),
        askgate::breaker::CircuitState::Closed
    );
}

#[tokio::test]
async fn deadline_with_partial_context_proceeds() {
    let (core, _dir) = test_core(|c| {
        c.query.deadline_ms = 300;
    })
    .await;

    let mut registry = SourceRegistry::empty();
    registry.register(Arc::new(MockAdapter::ok(
        SourceId::Jira,
        vec![document(SourceId::Jira, "J-9", "Fast ticket", "fast ticket body text")],
    )));
    registry.register(Arc::new(MockAdapter::slow(
        SourceId::Confluence,
        vec![document(SourceId::Confluence, "C-9", "Slow page", "slow body")],
        Duration::from_millis(800),
    )));

    let s = settings(&[SourceId::Jira, SourceId::Confluence]);
    let q = query_for(&core, "ticket and wiki page for the rollout", &s);
    let events =
        run_and_collect(&core, q, s, registry, MockStreamer::answering(&["Partial answer."])).await;

    let StreamEvent::Done { used_sources, .. } = events.last().unwrap() else {
        panic!("expected done with partial context, got {:?}", events.last());
    };
    assert!(used_sources.contains(&SourceId::Jira));
    assert!(!used_sources.contains(&SourceId::Confluence));
}

#[tokio::test]
async fn deadline_with_no_context_is_terminal_deadline() {
    let (core, _dir) = test_core(|c| {
        c.query.deadline_ms = 200;
    })
    .await;

    let mut registry = SourceRegistry::empty();
    registry.register(Arc::new(MockAdapter::slow(
        SourceId::Jira,
        vec![document(SourceId::Jira, "J-1", "T", "body")],
        Duration::from_millis(600),
    )));

    let s = settings(&[SourceId::Jira]);
    let q = query_for(&core, "status of the build ticket", &s);
    let events = run_and_collect(&core, q, s, registry, MockStreamer::answering(&["x"])).await;

    let StreamEvent::Error { kind, .. } = events.last().unwrap() else {
        panic!("expected terminal error, got {:?}", events.last());
    };
    assert_eq!(*kind, ErrorKind::Deadline);
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn llm_rate_limit_mid_stream() {
    let (core, _dir) = test_core(|_| {}).await;

    let mut registry = SourceRegistry::empty();
    registry.register(Arc::new(MockAdapter::ok(
        SourceId::Jira,
        vec![document(SourceId::Jira, "J-2", "Ticket", "ticket body for the answer")],
    )));

    let s = settings(&[SourceId::Jira]);
    let q = query_for(&core, "what does ticket J-2 say", &s);
    let streamer =
        MockStreamer::failing_after(&["one ", "two ", "three "], LlmError::RateLimited);
    let events = run_and_collect(&core, q, s, registry, streamer).await;

    assert_eq!(chunk_texts(&events), vec!["one ", "two ", "three "]);
    let StreamEvent::Error { kind, .. } = events.last().unwrap() else {
        panic!("expected error, got {:?}", events.last());
    };
    assert_eq!(*kind, ErrorKind::RateLimited);
    assert_eq!(terminal_count(&events), 1);

    // Incomplete answers are never persisted.
    assert!(core.store.history("s-test").await.unwrap().is_empty());
}

#[tokio::test]
async fn successful_answer_is_persisted() {
    let (core, _dir) = test_core(|_| {}).await;

    let mut registry = SourceRegistry::empty();
    registry.register(Arc::new(MockAdapter::ok(
        SourceId::Jira,
        vec![document(SourceId::Jira, "J-3", "Ticket", "relevant ticket body")],
    )));

    let s = settings(&[SourceId::Jira]);
    let q = query_for(&core, "summarize the open bug ticket", &s);
    let events = run_and_collect(
        &core,
        q,
        s,
        registry,
        MockStreamer::answering(&["Answer ", "text."]),
    )
    .await;
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));

    let history = core.store.history("s-test").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].bot_response, "Answer text.");
    assert_eq!(history[0].used_sources, vec![SourceId::Jira]);
}

#[tokio::test]
async fn empty_retrieval_still_generates() {
    let (core, _dir) = test_core(|_| {}).await;

    // No registered sources, empty cache, nothing routable.
    let registry = SourceRegistry::empty();
    let s = settings(&[]);
    let q = query_for(&core, "anything at all", &s);
    let events = run_and_collect(
        &core,
        q,
        s,
        registry,
        MockStreamer::answering(&["I found no results."]),
    )
    .await;

    let StreamEvent::Sources { sources } = &events[1] else {
        panic!("expected sources");
    };
    assert!(sources.is_empty());
    assert_eq!(chunk_texts(&events), vec!["I found no results."]);
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test]
async fn client_disconnect_cancels_llm_stream() {
    let (core, _dir) = test_core(|_| {}).await;

    let mut registry = SourceRegistry::empty();
    registry.register(Arc::new(MockAdapter::ok(
        SourceId::Jira,
        vec![document(SourceId::Jira, "J-4", "Ticket", "body of the ticket")],
    )));

    let streamer = MockStreamer::slow(
        &["a", "b", "c", "d", "e", "f", "g", "h"],
        Duration::from_millis(50),
    );
    let cancelled_flag = Arc::clone(&streamer.cancelled);

    let s = settings(&[SourceId::Jira]);
    let q = query_for(&core, "long running bug ticket question", &s);

    let (tx, mut rx) = mpsc::channel(64);
    let core_clone = Arc::clone(&core);
    let handle = tokio::spawn(async move {
        run_query_with(
            &core_clone,
            q,
            s,
            Arc::new(registry),
            Box::new(streamer),
            tx,
            CancellationToken::new(),
        )
        .await;
    });

    // Read through the context event plus one chunk, then disconnect.
    let mut saw_chunk = false;
    while let Some(event) = rx.recv().await {
        if matches!(event, StreamEvent::Chunk { .. }) {
            saw_chunk = true;
            break;
        }
    }
    assert!(saw_chunk);
    drop(rx);

    handle.await.unwrap();
    // The LLM stream task observes cancellation within the shutdown grace.
    tokio::time::sleep(core.config.shutdown_grace()).await;
    assert!(cancelled_flag.load(Ordering::SeqCst));

    // Nothing was persisted for the aborted answer.
    assert!(core.store.history("s-test").await.unwrap().is_empty());
}

#[tokio::test]
async fn sole_source_rate_limited_with_empty_cache_is_terminal() {
    let (core, _dir) = test_core(|c| {
        // One token, glacial refill: the second acquire cannot be admitted.
        c.rategate.burst = 1;
        c.rategate.refill_per_sec = 0.01;
        c.query.deadline_ms = 400;
        c.query.per_source_timeout_ms = 300;
    })
    .await;

    let mut registry = SourceRegistry::empty();
    registry.register(Arc::new(MockAdapter::ok(
        SourceId::Jira,
        vec![document(SourceId::Jira, "J-5", "T", "body")],
    )));

    let s = settings(&[SourceId::Jira]);

    // First query consumes the only token.
    let q1 = query_for(&core, "first bug ticket", &s);
    let mut registry1 = SourceRegistry::empty();
    registry1.register(Arc::new(MockAdapter::ok(
        SourceId::Jira,
        vec![document(SourceId::Jira, "J-5", "T", "body")],
    )));
    let events = run_and_collect(&core, q1, s.clone(), registry1, MockStreamer::answering(&["ok"])).await;
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));

    // Second query cannot be admitted before its deadline.
    let q2 = query_for(&core, "second bug ticket", &s);
    let events = run_and_collect(&core, q2, s, registry, MockStreamer::answering(&["ok"])).await;
    let StreamEvent::Error { kind, .. } = events.last().unwrap() else {
        panic!("expected rate-limited terminal, got {:?}", events.last());
    };
    assert_eq!(*kind, ErrorKind::RateLimited);
}
