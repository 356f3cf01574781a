//! # memex
//!
//! Incremental multi-source sync and hybrid retrieval for a personal
//! knowledge base.
//!
//! Source connectors (mail, calendar, drive, code hosting, chat, reference
//! libraries) hand normalized records to the sync orchestrator, which keeps
//! one SQLite store consistent with every source. Stored content is chunked,
//! embedded and indexed into per-kind vector collections, and the query
//! engine fuses keyword and semantic search into one ranked list.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Connector  │──▶│     Sync     │──▶│ SqliteStore  │
//! │ (per source)│   │ Orchestrator │   │ graph+cursor │
//! └─────────────┘   └──────┬───────┘   └──────┬───────┘
//!                          ▼                  │
//!                  ┌──────────────┐           │
//!                  │   Semantic   │           │
//!                  │   Indexer    │           │
//!                  └──────┬───────┘           │
//!                         ▼                   ▼
//!                  ┌──────────────┐   ┌──────────────┐
//!                  │ VectorStore  │──▶│ QueryEngine  │
//!                  └──────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Entities, content, relationships, sync state |
//! | [`store`] | Storage layer with changelog |
//! | [`chunk`] | Sentence-aware text and email chunking |
//! | [`embedding`] | Providers, cache, retrying batch embedder |
//! | [`vector_store`] | Named-collection nearest-neighbour index |
//! | [`semantic`] | Chunk → embed → vector pipeline |
//! | [`extract`] | Person extraction from address headers |
//! | [`sync`] | Full and delta sync protocol |
//! | [`progress`] | Sync progress reporting |
//! | [`query`] | Hybrid keyword + semantic retrieval |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod query;
pub mod semantic;
pub mod store;
pub mod sync;
pub mod vector_store;

pub use error::{Error, Result};
