//! # knowbase
//!
//! Retrieval and AI-orchestration engine for a personal knowledge base:
//! hybrid keyword + semantic search over note chunks, RAG chat with a
//! bounded self-evaluation loop, and graceful degradation to pure
//! keyword behavior whenever the AI backend is unreachable.
//!
//! # Architecture
//!
//! ```text
//! documents ──▶ index (chunks, TF-IDF, vectors)
//!                  │
//!                  ▼
//!  search ──▶ retrieval engine ──▶ degradation controller ──▶ HTTP API
//!                                      ▲          │
//!                     availability ────┘          ▼
//!                     monitor              chat orchestrator ──▶ SSE frames
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Shared data types (documents, results, chat state) |
//! | [`chunk`] | Paragraph-based document chunking |
//! | [`index`] | [`index::IndexStore`] trait and in-memory implementation |
//! | [`search`] | Keyword / semantic / mixed retrieval with score blending |
//! | [`backend`] | HTTP client for the embedding + generation service |
//! | [`availability`] | Cached, fail-closed backend availability |
//! | [`degrade`] | Degradation policy and non-AI fallbacks |
//! | [`chat`] | RAG chat orchestrator with supplement loop |
//! | [`protocol`] | SSE frame encoding, decoding, and message assembly |
//! | [`server`] | Axum HTTP API |
//! | [`ingest`] | Filesystem note ingestion |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error taxonomy and degradability classification |

pub mod availability;
pub mod backend;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod degrade;
pub mod error;
pub mod index;
pub mod ingest;
pub mod models;
pub mod protocol;
pub mod search;
pub mod server;

pub use config::{load_config, Config};
pub use error::{Error, Result};
