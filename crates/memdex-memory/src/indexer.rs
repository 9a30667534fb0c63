use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use memdex_core::{FileRecord, MemdexError, MemdexResult, NewChunk};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunker::{chunk_markdown, TextChunk};
use crate::config::MemoryConfig;
use crate::embedding::{truncate_for_embedding, Embeddings};
use crate::store::Store;

/// Aggregate result of a full reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    /// Files whose chunks were (re)written.
    pub files_indexed: usize,
    /// Files skipped by the hash and model check.
    pub files_unchanged: usize,
    /// Files whose stored state was deleted.
    pub files_removed: usize,
    /// Files left as they were because they could not be read.
    pub files_skipped: usize,
    /// Chunks written across all indexed files.
    pub chunks_written: usize,
    /// Walk entries or files that failed with an error.
    pub errors: usize,
}

impl IndexReport {
    fn tally(&mut self, path: &str, result: MemdexResult<FileOutcome>) {
        match result {
            Ok(FileOutcome::Indexed { chunks }) => {
                self.files_indexed += 1;
                self.chunks_written += chunks;
            }
            Ok(FileOutcome::Unchanged) => self.files_unchanged += 1,
            Ok(FileOutcome::Removed) => self.files_removed += 1,
            Ok(FileOutcome::Skipped) => self.files_skipped += 1,
            Err(e) => {
                warn!(path = %path, error = %e, "failed to index file");
                self.errors += 1;
            }
        }
    }
}

/// What [`Indexer::index_file`] did for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Content changed (or was new); the file's chunks were replaced.
    Indexed {
        /// Number of chunks written.
        chunks: usize,
    },
    /// Hash and embedding model match the stored record, or a missing file
    /// had nothing stored.
    Unchanged,
    /// The path is gone from disk or no longer names a memory file (hidden,
    /// symlinked, unrecognised extension); its stored state was deleted.
    Removed,
    /// Not indexed this time: unreadable, not UTF-8, or not a memory file
    /// with nothing stored.
    Skipped,
}

/// Keeps the store in sync with the files under the memory root.
///
/// Unchanged files (same content hash, same embedding model) are never
/// re-chunked or re-embedded. Changed files are replaced as a whole in one
/// store transaction. Calls for the same path are serialised; different
/// paths proceed concurrently.
pub struct Indexer {
    root: PathBuf,
    config: MemoryConfig,
    store: Arc<Store>,
    embeddings: Embeddings,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Indexer {
    /// Indexer over `config.memory_root`.
    pub fn new(config: MemoryConfig, store: Arc<Store>, embeddings: Embeddings) -> Self {
        Self {
            root: config.memory_root.clone(),
            config,
            store,
            embeddings,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// The memory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configuration this indexer was built with.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The embedding backend, possibly unavailable.
    pub fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    /// Whether new chunks get an embedding.
    fn vectors_active(&self) -> bool {
        self.embeddings.is_available() && self.store.is_vector_enabled()
    }

    /// Reconcile every recognised file under the root with the store, then
    /// drop records for files that no longer exist.
    pub async fn index_all(&self) -> MemdexResult<IndexReport> {
        if !self.root.is_dir() {
            return Err(MemdexError::Index(format!(
                "memory root {} is not a directory",
                self.root.display()
            )));
        }

        let mut report = IndexReport::default();
        let (files, walk_errors) = self.scan(&self.root);
        report.errors += walk_errors;

        let mut on_disk = HashSet::with_capacity(files.len());
        for rel in files {
            let result = self.index_file(Path::new(&rel)).await;
            report.tally(&rel, result);
            on_disk.insert(rel);
        }
        self.sweep_stale(&on_disk, &mut report).await?;

        info!(
            indexed = report.files_indexed,
            unchanged = report.files_unchanged,
            removed = report.files_removed,
            skipped = report.files_skipped,
            chunks = report.chunks_written,
            errors = report.errors,
            "memory index reconciled"
        );
        Ok(report)
    }

    /// Re-check every stored record the scan did not see. The file may have
    /// appeared since the scan, so each one goes through [`Self::index_file`],
    /// which only removes it if it is really gone.
    async fn sweep_stale(
        &self,
        seen: &HashSet<String>,
        report: &mut IndexReport,
    ) -> MemdexResult<()> {
        for record in self.store.get_all_files()? {
            if seen.contains(&record.path) {
                continue;
            }
            let result = self.index_file(Path::new(&record.path)).await;
            report.tally(&record.path, result);
        }
        Ok(())
    }

    /// Reconcile everything at or below `path`: every stored record under
    /// that prefix plus every memory file found there now. Directory moves
    /// and deletes produce no per-file events, so the watcher uses this.
    pub async fn index_subtree(&self, path: &Path) -> MemdexResult<IndexReport> {
        let rel = self.relative_path(path)?;
        let abs = self.absolute_path(&rel);
        let prefix = format!("{rel}/");

        let mut report = IndexReport::default();
        let mut candidates: BTreeSet<String> = self
            .store
            .get_all_files()?
            .into_iter()
            .map(|record| record.path)
            .filter(|stored| stored.starts_with(&prefix))
            .collect();
        if abs.is_dir() {
            let (files, walk_errors) = self.scan(&abs);
            report.errors += walk_errors;
            candidates.extend(files);
        }

        for candidate in candidates {
            let result = self.index_file(Path::new(&candidate)).await;
            report.tally(&candidate, result);
        }
        debug!(
            path = %rel,
            indexed = report.files_indexed,
            removed = report.files_removed,
            "subtree reconciled"
        );
        Ok(report)
    }

    /// Bring one path in line with its on-disk state. `path` is either
    /// absolute (inside the root) or relative to the root.
    ///
    /// A missing file has its stored state removed, and so does a path that
    /// is no longer a memory file. Calling this twice with no change in
    /// between leaves the store untouched the second time.
    pub async fn index_file(&self, path: &Path) -> MemdexResult<FileOutcome> {
        let rel = self.relative_path(path)?;
        let abs = self.absolute_path(&rel);

        let lock = self.path_lock(&rel);
        let outcome = {
            let _guard = lock.lock().await;
            if self.config.is_memory_file(Path::new(&rel)) {
                self.reconcile(&rel, &abs).await
            } else {
                debug!(path = %rel, "not a memory file");
                self.forget(&rel)
            }
        };
        self.release_path_lock(&rel, lock);
        outcome
    }

    /// Delete every chunk and the record for `path`. Returns whether anything
    /// was stored; unknown paths are a no-op.
    pub async fn remove_file(&self, path: &Path) -> MemdexResult<bool> {
        let rel = self.relative_path(path)?;
        let lock = self.path_lock(&rel);
        let removed = {
            let _guard = lock.lock().await;
            self.store.remove_file(&rel)
        };
        self.release_path_lock(&rel, lock);
        if matches!(removed, Ok(true)) {
            info!(path = %rel, "removed file from index");
        }
        removed
    }

    /// Drop stored state for a path that must not be indexed.
    fn forget(&self, rel: &str) -> MemdexResult<FileOutcome> {
        if self.store.remove_file(rel)? {
            info!(path = %rel, "no longer a memory file, removed from index");
            Ok(FileOutcome::Removed)
        } else {
            Ok(FileOutcome::Skipped)
        }
    }

    async fn reconcile(&self, rel: &str, abs: &Path) -> MemdexResult<FileOutcome> {
        let metadata = match tokio::fs::symlink_metadata(abs).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return if self.store.remove_file(rel)? {
                    info!(path = %rel, "file deleted, removed from index");
                    Ok(FileOutcome::Removed)
                } else {
                    Ok(FileOutcome::Unchanged)
                };
            }
            Err(e) => {
                warn!(path = %rel, error = %e, "cannot stat file, skipping");
                return Ok(FileOutcome::Skipped);
            }
        };
        if !metadata.is_file() {
            return self.forget(rel);
        }

        let bytes = match tokio::fs::read(abs).await {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %rel, error = %e, "cannot read file, keeping previous index state");
                return Ok(FileOutcome::Skipped);
            }
        };
        let content = match String::from_utf8(bytes) {
            Ok(c) => c,
            Err(_) => {
                warn!(path = %rel, "file is not valid UTF-8, keeping previous index state");
                return Ok(FileOutcome::Skipped);
            }
        };

        let hash = sha256_hex(content.as_bytes());
        let model = if self.vectors_active() {
            self.embeddings.model_name().map(str::to_string)
        } else {
            None
        };
        if let Some(existing) = self.store.get_file(rel)? {
            if existing.hash == hash && existing.model == model {
                debug!(path = %rel, "unchanged, skipping");
                return Ok(FileOutcome::Unchanged);
            }
        }

        let pieces = chunk_markdown(&content, self.config.max_chunk_chars);
        let (chunks, embedded) = self.build_chunks(rel, pieces).await;
        let record = FileRecord {
            path: rel.to_string(),
            hash,
            mtime: metadata
                .modified()
                .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                .unwrap_or_default(),
            size: metadata.len(),
            model: if embedded { model } else { None },
        };

        self.store.replace_file(&record, &chunks)?;
        info!(path = %rel, chunks = chunks.len(), embedded, "indexed file");
        Ok(FileOutcome::Indexed {
            chunks: chunks.len(),
        })
    }

    /// Attach ids and, when possible, embeddings. A failed embedding call
    /// stores the chunks lexical-only; the missing model on the file record
    /// makes the next pass retry.
    async fn build_chunks(&self, rel: &str, pieces: Vec<TextChunk>) -> (Vec<NewChunk>, bool) {
        let mut embeddings = None;
        if self.vectors_active() && !pieces.is_empty() {
            let inputs: Vec<&str> = pieces
                .iter()
                .map(|p| truncate_for_embedding(&p.text, self.config.max_embed_chars))
                .collect();
            match self.embeddings.embed_batch(&inputs).await {
                Ok(vectors) => embeddings = Some(vectors),
                Err(e) => {
                    warn!(
                        path = %rel,
                        error = %e,
                        "embedding failed, storing chunks without vectors"
                    );
                }
            }
        }
        let embedded = embeddings.is_some() || (self.vectors_active() && pieces.is_empty());

        let mut vectors = embeddings.map(Vec::into_iter);
        let chunks = pieces
            .into_iter()
            .map(|piece| {
                let hash = sha256_hex(piece.text.as_bytes());
                NewChunk {
                    id: chunk_id(rel, piece.start_line, &hash),
                    text: piece.text,
                    start_line: piece.start_line,
                    end_line: piece.end_line,
                    hash,
                    embedding: vectors.as_mut().and_then(Iterator::next),
                }
            })
            .collect();
        (chunks, embedded)
    }

    /// Memory files under `dir` (the root or a directory inside it) as
    /// normalised relative paths, plus the number of entries that could not
    /// be read. Symlinks are not followed and never count as files.
    fn scan(&self, dir: &Path) -> (Vec<String>, usize) {
        let mut files = Vec::new();
        let mut errors = 0;
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "failed to walk memory root");
                    errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let within_root = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            match self.relative_path(within_root) {
                Ok(rel) if self.config.is_memory_file(Path::new(&rel)) => files.push(rel),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping path");
                    errors += 1;
                }
            }
        }
        (files, errors)
    }

    /// Normalise `path` to the stored form: relative to the root, `/`
    /// separated, without `.` or `..` segments.
    pub fn relative_path(&self, path: &Path) -> MemdexResult<String> {
        let relative = if path.is_absolute() {
            match path.strip_prefix(&self.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => {
                    let canonical_root = self.root.canonicalize().map_err(|_| outside(path))?;
                    path.strip_prefix(&canonical_root)
                        .map_err(|_| outside(path))?
                        .to_path_buf()
                }
            }
        } else {
            path.to_path_buf()
        };

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return Err(outside(path)),
            }
        }
        if parts.is_empty() {
            return Err(MemdexError::InvalidInput(format!(
                "{} does not name a file",
                path.display()
            )));
        }
        Ok(parts.join("/"))
    }

    fn absolute_path(&self, rel: &str) -> PathBuf {
        rel.split('/').fold(self.root.clone(), |acc, part| acc.join(part))
    }

    fn path_lock(&self, rel: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(rel.to_string()).or_default().clone()
    }

    /// Drop the lock entry once no other caller holds or waits on it.
    fn release_path_lock(&self, rel: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(rel);
        }
    }
}

fn outside(path: &Path) -> MemdexError {
    MemdexError::InvalidInput(format!(
        "{} is outside the memory root",
        path.display()
    ))
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stable chunk id: first 32 hex chars of `sha256(path:start_line:hash)`.
///
/// Unchanged text at the same place keeps its id across re-indexing; any
/// change to the text produces a new one.
pub fn chunk_id(path: &str, start_line: usize, chunk_hash: &str) -> String {
    let mut id = sha256_hex(format!("{path}:{start_line}:{chunk_hash}").as_bytes());
    id.truncate(32);
    id
}
