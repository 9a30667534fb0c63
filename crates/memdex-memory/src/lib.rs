//! Incremental hybrid search over a directory of memory files.
//!
//! Files under the memory root are split into paragraph chunks, stored in
//! SQLite with an FTS5 lexical index and an optional vector index, and kept
//! in sync by content hash. Searches run both indexes and merge the two
//! rankings with Reciprocal Rank Fusion.
//!
//! # Main types
//!
//! - [`MemoryService`] — Façade owning the store, indexer, searcher and watcher.
//! - [`Store`] — SQLite storage engine (chunks, file records, FTS5, vectors).
//! - [`Indexer`] — Hash-based incremental reconciliation of files into the store.
//! - [`HybridSearcher`] — Lexical + vector search fused with RRF.
//! - [`MemoryWatcher`] — Debounced filesystem watcher driving the indexer.
//! - [`EmbeddingProvider`] — Trait for text embedding backends.
//! - [`LocalEmbedding`] — Hashed bag-of-words embedding, no model needed.

/// Markdown-aware paragraph chunking.
pub mod chunker;
/// Memory configuration loaded from `memdex.toml`.
pub mod config;
/// Embedding provider trait, availability wrapper and local implementation.
pub mod embedding;
/// OpenAI-compatible HTTP embedding backend.
#[cfg(feature = "http-embeddings")]
pub mod embedding_http;
/// Reciprocal Rank Fusion of two ranked id lists.
pub mod fusion;
/// Hybrid search combining FTS5 and vector search.
pub mod hybrid;
/// Incremental file indexing.
pub mod indexer;
/// Service façade for host processes.
pub mod service;
/// SQLite storage engine.
pub mod store;
/// Filesystem change watcher.
pub mod watcher;

pub use chunker::{chunk_markdown, TextChunk};
pub use config::{
    has_hidden_segment, sanitize_project_id, EmbeddingBackend, EmbeddingConfig, MemoryConfig,
};
pub use embedding::{EmbeddingProvider, Embeddings, LocalEmbedding};
#[cfg(feature = "http-embeddings")]
pub use embedding_http::HttpEmbedding;
pub use fusion::{reciprocal_rank_fusion, FusedHit, FusionWeights};
pub use hybrid::{HybridSearcher, SearchResult};
pub use indexer::{chunk_id, FileOutcome, IndexReport, Indexer};
pub use service::{MemoryService, MemoryStatus, WriteReport};
pub use store::{LexicalHit, Snapshot, Store, StoreOptions, VectorHit};
pub use watcher::{MemoryWatcher, WatcherOptions};
