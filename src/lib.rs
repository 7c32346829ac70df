//! # Askgate
//!
//! **A streaming retrieval-augmented answering gateway.**
//!
//! Askgate accepts a natural-language question, decides which knowledge
//! sources can answer it, fans out to those sources in parallel under
//! rate-limit and circuit-breaker control, packs the results into a
//! token-budgeted context, and streams a model-generated answer back to the
//! client over server-sent events. Fetched material is written into a
//! persistent semantic cache so similar questions can short-circuit the
//! external calls next time.
//!
//! ## Architecture
//!
//! ```text
//! request ──▶ Router ──▶ Orchestrator ──▶ SourceAdapters (jira, slack, …)
//!                             │                   │
//!                             │◀── documents ─────┘
//!                             │            ╲ (async write-back)
//!                             ▼             ▼
//!                       ContextBuilder   VectorCache (SQLite)
//!                             │
//!                             ▼
//!                        LlmStreamer ──▶ SSE events ──▶ client
//! ```
//!
//! Data flows one direction. The vector cache is both a fan-out target
//! (zero-cost local lookup) and the destination of asynchronous write-backs
//! after successful fetches.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, env overrides, validation |
//! | [`models`] | `SourceId`, `Query`, `Document`, `Chunk`, `Settings`, … |
//! | [`error`] | Wire error taxonomy and fetch-failure classification |
//! | [`rategate`] | Token-bucket + sliding-window admission per source |
//! | [`breaker`] | Three-state circuit breaker per source |
//! | [`source`] | `SourceAdapter` contract, HTTP adapter, registry |
//! | [`embedder`] | Deterministic local batched embeddings |
//! | [`vector_cache`] | Persistent similarity index with LRU eviction |
//! | [`chunker`] | Token-aware overlapping window splitter |
//! | [`router`] | Pure keyword-rule source selection |
//! | [`orchestrator`] | Deadline-bounded parallel fan-out and aggregation |
//! | [`context`] | Scoring, dedup, token-budgeted packing |
//! | [`llm`] | Provider-neutral streaming over four model families |
//! | [`protocol`] | SSE event types and framing |
//! | [`pipeline`] | End-to-end query execution |
//! | [`store`] | Settings and transcript persistence |
//! | [`server`] | Axum HTTP surface |
//! | [`core`] | Long-lived shared state, built once at startup |

pub mod breaker;
pub mod chunker;
pub mod config;
pub mod context;
pub mod core;
pub mod embedder;
pub mod error;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod protocol;
pub mod rategate;
pub mod router;
pub mod server;
pub mod source;
pub mod store;
pub mod vector_cache;
