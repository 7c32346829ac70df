//! Provider-neutral LLM streaming.
//!
//! [`LlmStreamer::stream`] takes the ordered conversation and returns a
//! bounded channel of text fragments. Every provider-specific shape —
//! OpenAI-style SSE, Anthropic SSE, Ollama JSON-lines, Gemini's unary REST —
//! is adapted behind that one contract, and provider errors are collapsed to
//! the closed [`LlmError`] set.
//!
//! The channel is bounded: when the SSE writer cannot keep up, the sender
//! blocks, which stops the byte-stream read loop and lets TCP backpressure
//! pause the provider. Cancelling the token aborts the upstream request.
//!
//! Providers without a native stream (Gemini here) fetch the full completion
//! and emit it in word-group fragments so downstream code stays uniform.

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::{LlmProviderId, Settings};

/// Closed set of LLM failure modes (§ error taxonomy).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("provider rejected credentials")]
    Auth,
    #[error("provider rate limited")]
    RateLimited,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("provider timed out")]
    UpstreamTimeout,
    #[error("provider error: {0}")]
    Upstream(String),
}

impl LlmError {
    fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => LlmError::Auth,
            429 => LlmError::RateLimited,
            400 | 404 | 422 => LlmError::BadRequest(truncate(body, 200)),
            _ => LlmError::Upstream(format!("http {}: {}", status, truncate(body, 200))),
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::UpstreamTimeout
        } else {
            LlmError::Upstream(e.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// One message in the conversation sent to the provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Generation parameters shared by all providers.
#[derive(Debug, Clone)]
pub struct GenParams {
    pub model: String,
    pub api_key: String,
    /// Override for self-hosted or proxy endpoints.
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Capacity of the token channel handed to the consumer.
    pub channel_cap: usize,
}

impl GenParams {
    pub fn from_settings(settings: &Settings, channel_cap: usize) -> Self {
        Self {
            model: settings.llm_model.clone(),
            api_key: settings.llm_api_key.clone(),
            base_url: None,
            temperature: 0.7,
            max_tokens: 2048,
            channel_cap,
        }
    }
}

/// Incremental text fragments, or a mapped error ending the stream.
pub type TokenRx = mpsc::Receiver<Result<String, LlmError>>;

/// Provider-neutral streaming contract.
#[async_trait]
pub trait LlmStreamer: Send + Sync {
    /// Start a completion and return the fragment channel. Cancelling
    /// `cancel` stops the upstream request; the channel then closes.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenParams,
        cancel: CancellationToken,
    ) -> Result<TokenRx, LlmError>;

    /// Minimal one-token completion to verify connectivity and credentials.
    async fn probe(&self, params: &GenParams) -> Result<(), LlmError>;
}

/// Instantiate the adapter for a provider family.
pub fn create_streamer(provider: LlmProviderId) -> Box<dyn LlmStreamer> {
    match provider {
        LlmProviderId::Openai => Box::new(OpenAiStreamer),
        LlmProviderId::Anthropic => Box::new(AnthropicStreamer),
        LlmProviderId::Gemini => Box::new(GeminiStreamer),
        LlmProviderId::Ollama => Box::new(OllamaStreamer),
    }
}

fn http_client() -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(LlmError::from_reqwest)
}

/// Drive a line-delimited byte stream, forwarding each extracted fragment
/// until the stream ends, the parser says stop, or the token is cancelled.
///
/// `extract` maps one wire line to `Ok(Some(text))` for a fragment,
/// `Ok(None)` to skip, `Err(Some(e))` for a terminal provider error, and
/// `Err(None)` for end-of-stream sentinels.
async fn pump_lines<F>(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<String, LlmError>>,
    cancel: CancellationToken,
    extract: F,
) where
    F: Fn(&str) -> Result<Option<String>, Option<LlmError>> + Send + 'static,
{
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("llm stream cancelled");
                return;
            }
            chunk = stream.next() => chunk,
        };

        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx.send(Err(LlmError::from_reqwest(e))).await;
                return;
            }
            None => return,
        };

        buffer.push_str(&String::from_utf8_lossy(&bytes));
        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim().to_string();
            buffer.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            match extract(&line) {
                Ok(Some(text)) => {
                    if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                        return; // consumer gone
                    }
                }
                Ok(None) => {}
                Err(Some(e)) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                Err(None) => return,
            }
        }
    }
}

// ============ OpenAI-compatible ============

/// Chat-completions SSE, also spoken by most self-hosted gateways.
pub struct OpenAiStreamer;

fn openai_endpoint(base_url: Option<&str>) -> String {
    let base = base_url.unwrap_or("https://api.openai.com/v1");
    format!("{}/chat/completions", base.trim_end_matches('/'))
}

#[async_trait]
impl LlmStreamer for OpenAiStreamer {
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenParams,
        cancel: CancellationToken,
    ) -> Result<TokenRx, LlmError> {
        let body = serde_json::json!({
            "model": params.model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": true,
        });

        let response = http_client()?
            .post(openai_endpoint(params.base_url.as_deref()))
            .bearer_auth(&params.api_key)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status().as_u16();
        if status != 200 {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &text));
        }

        let (tx, rx) = mpsc::channel(params.channel_cap);
        tokio::spawn(pump_lines(response, tx, cancel, |line| {
            let Some(data) = line.strip_prefix("data:") else {
                return Ok(None);
            };
            let data = data.trim();
            if data == "[DONE]" {
                return Err(None);
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                return Ok(None);
            };
            Ok(value["choices"][0]["delta"]["content"]
                .as_str()
                .map(str::to_string))
        }));
        Ok(rx)
    }

    async fn probe(&self, params: &GenParams) -> Result<(), LlmError> {
        let body = serde_json::json!({
            "model": params.model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });
        let response = http_client()?
            .post(openai_endpoint(params.base_url.as_deref()))
            .bearer_auth(&params.api_key)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;
        let status = response.status().as_u16();
        if status == 200 {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(LlmError::from_status(status, &text))
        }
    }
}

// ============ Anthropic ============

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicStreamer;

fn anthropic_endpoint(base_url: Option<&str>) -> String {
    let base = base_url.unwrap_or("https://api.anthropic.com");
    format!("{}/v1/messages", base.trim_end_matches('/'))
}

/// Anthropic keeps the system prompt out of the message list.
fn split_system(messages: Vec<ChatMessage>) -> (Option<String>, Vec<ChatMessage>) {
    let mut system = None;
    let rest = messages
        .into_iter()
        .filter(|m| {
            if m.role == "system" {
                system = Some(m.content.clone());
                false
            } else {
                true
            }
        })
        .collect();
    (system, rest)
}

#[async_trait]
impl LlmStreamer for AnthropicStreamer {
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenParams,
        cancel: CancellationToken,
    ) -> Result<TokenRx, LlmError> {
        let (system, rest) = split_system(messages);
        let mut body = serde_json::json!({
            "model": params.model,
            "max_tokens": params.max_tokens,
            "messages": rest,
            "stream": true,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }

        let response = http_client()?
            .post(anthropic_endpoint(params.base_url.as_deref()))
            .header("x-api-key", &params.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status().as_u16();
        if status != 200 {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &text));
        }

        let (tx, rx) = mpsc::channel(params.channel_cap);
        tokio::spawn(pump_lines(response, tx, cancel, |line| {
            let Some(data) = line.strip_prefix("data:") else {
                return Ok(None); // `event:` lines carry no payload
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data.trim()) else {
                return Ok(None);
            };
            match value["type"].as_str() {
                Some("content_block_delta") => {
                    Ok(value["delta"]["text"].as_str().map(str::to_string))
                }
                Some("message_stop") => Err(None),
                Some("error") => Err(Some(LlmError::Upstream(
                    value["error"]["message"].as_str().unwrap_or("stream error").to_string(),
                ))),
                _ => Ok(None),
            }
        }));
        Ok(rx)
    }

    async fn probe(&self, params: &GenParams) -> Result<(), LlmError> {
        let body = serde_json::json!({
            "model": params.model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        let response = http_client()?
            .post(anthropic_endpoint(params.base_url.as_deref()))
            .header("x-api-key", &params.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;
        let status = response.status().as_u16();
        if status == 200 {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(LlmError::from_status(status, &text))
        }
    }
}

// ============ Gemini ============

/// Gemini's REST surface is unary here; streaming is simulated by splitting
/// the finished completion into word-group fragments.
pub struct GeminiStreamer;

fn gemini_endpoint(base_url: Option<&str>, model: &str, api_key: &str) -> String {
    let base = base_url.unwrap_or("https://generativelanguage.googleapis.com/v1beta");
    format!(
        "{}/models/{}:generateContent?key={}",
        base.trim_end_matches('/'),
        model,
        api_key
    )
}

/// Split into fragments of a few words each so downstream behaves as if the
/// provider streamed.
pub fn simulate_fragments(text: &str, words_per_fragment: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_inclusive(char::is_whitespace).collect();
    words
        .chunks(words_per_fragment)
        .map(|group| group.concat())
        .collect()
}

#[async_trait]
impl LlmStreamer for GeminiStreamer {
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenParams,
        cancel: CancellationToken,
    ) -> Result<TokenRx, LlmError> {
        // Gemini has no system role on this surface; fold the conversation
        // into one prompt the way the contents API expects.
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": params.temperature,
                "maxOutputTokens": params.max_tokens,
            },
        });

        let response = http_client()?
            .post(gemini_endpoint(
                params.base_url.as_deref(),
                &params.model,
                &params.api_key,
            ))
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status().as_u16();
        if status != 200 {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &text));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Upstream(format!("malformed response: {}", e)))?;
        let text = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let (tx, rx) = mpsc::channel(params.channel_cap);
        tokio::spawn(async move {
            for fragment in simulate_fragments(&text, 4) {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(Ok(fragment)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn probe(&self, params: &GenParams) -> Result<(), LlmError> {
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": "ping"}]}],
            "generationConfig": {"maxOutputTokens": 1},
        });
        let response = http_client()?
            .post(gemini_endpoint(
                params.base_url.as_deref(),
                &params.model,
                &params.api_key,
            ))
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;
        let status = response.status().as_u16();
        if status == 200 {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(LlmError::from_status(status, &text))
        }
    }
}

// ============ Ollama ============

/// Local Ollama daemon: JSON-lines streaming over `/api/chat`.
pub struct OllamaStreamer;

fn ollama_endpoint(base_url: Option<&str>) -> String {
    let base = base_url.unwrap_or("http://localhost:11434");
    format!("{}/api/chat", base.trim_end_matches('/'))
}

#[async_trait]
impl LlmStreamer for OllamaStreamer {
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenParams,
        cancel: CancellationToken,
    ) -> Result<TokenRx, LlmError> {
        let body = serde_json::json!({
            "model": params.model,
            "messages": messages,
            "stream": true,
        });

        let response = http_client()?
            .post(ollama_endpoint(params.base_url.as_deref()))
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status().as_u16();
        if status != 200 {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &text));
        }

        let (tx, rx) = mpsc::channel(params.channel_cap);
        tokio::spawn(pump_lines(response, tx, cancel, |line| {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                return Ok(None);
            };
            if value["done"].as_bool() == Some(true) {
                return Err(None);
            }
            Ok(value["message"]["content"].as_str().map(str::to_string))
        }));
        Ok(rx)
    }

    async fn probe(&self, params: &GenParams) -> Result<(), LlmError> {
        let body = serde_json::json!({
            "model": params.model,
            "messages": [{"role": "user", "content": "ping"}],
            "stream": false,
        });
        let response = http_client()?
            .post(ollama_endpoint(params.base_url.as_deref()))
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;
        let status = response.status().as_u16();
        if status == 200 {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(LlmError::from_status(status, &text))
        }
    }
}
