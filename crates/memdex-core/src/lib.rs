//! Core types and error definitions for memdex.
//!
//! This crate provides the foundational types shared across all memdex crates:
//! the error enum and the persisted data model of the memory index.
//!
//! # Main types
//!
//! - [`MemdexError`] — Unified error enum for all memdex subsystems.
//! - [`MemdexResult`] — Convenience alias for `Result<T, MemdexError>`.
//! - [`Chunk`] — A stored slice of one memory file, the atomic search unit.
//! - [`NewChunk`] — A chunk about to be written, before the store stamps it.
//! - [`FileRecord`] — Per-file indexing state used for hash-based skipping.
//! - [`StoreStats`] — Aggregate counts and capability flags of a store.

mod error;

pub use error::{MemdexError, MemdexResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Chunk types ---

/// A contiguous slice of one file's text as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier derived from path, position and chunk text.
    pub id: String,
    /// Owning file, relative to the memory root, `/`-separated.
    pub path: String,
    /// Raw chunk text.
    pub text: String,
    /// First line of the chunk (1-based, inclusive).
    pub start_line: usize,
    /// Last line of the chunk (1-based, inclusive).
    pub end_line: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    /// When the chunk row was last written.
    pub updated_at: DateTime<Utc>,
}

/// A chunk produced by the indexer and handed to the store for writing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    /// Stable id derived from path, start line and text hash.
    pub id: String,
    /// Chunk text as it appears in the file.
    pub text: String,
    /// First line, 1-based.
    pub start_line: usize,
    /// Last line, inclusive.
    pub end_line: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    /// Present only if an embedding provider was available at index time.
    pub embedding: Option<Vec<f32>>,
}

// --- File types ---

/// Per-file indexing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the memory root (unique key).
    pub path: String,
    /// SHA-256 of the whole file content, hex encoded.
    pub hash: String,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: i64,
    /// Size in bytes.
    pub size: u64,
    /// Embedding model the chunks were embedded with; `None` when the file
    /// was indexed lexical-only.
    pub model: Option<String>,
}

// --- Stats ---

/// Aggregate counts and capability flags reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Stored chunks.
    pub chunks: usize,
    /// Stored file records.
    pub files: usize,
    /// Size of the database file, 0 for an in-memory store.
    pub db_size_bytes: u64,
    /// Whether vector search is active. Callers must check this before
    /// treating an empty vector result as "no matches".
    pub vector_enabled: bool,
    /// Whether the FTS5 index is available.
    pub lexical_enabled: bool,
}
