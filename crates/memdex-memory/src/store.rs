use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use memdex_core::{Chunk, FileRecord, MemdexError, MemdexResult, NewChunk, StoreStats};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    text TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    hash TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path);

CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    mtime INTEGER NOT NULL,
    size INTEGER NOT NULL,
    model TEXT
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text, id UNINDEXED, path UNINDEXED
);
";

const VECTOR_SQL: &str = "
CREATE TABLE IF NOT EXISTS chunks_vec (
    id TEXT PRIMARY KEY,
    embedding BLOB NOT NULL
);
";

const CHUNK_COLUMNS: &str = "id, path, text, start_line, end_line, hash, updated_at";

/// Options fixed for the lifetime of an opened [`Store`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Dimension of the embeddings that will be written. `None` disables the
    /// vector index entirely (lexical-only mode).
    pub vector_dimension: Option<usize>,
}

/// A lexical match: chunk id plus the FTS5 `rank` (lower is better).
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    /// Chunk id.
    pub id: String,
    /// FTS5 rank.
    pub rank: f64,
}

/// A vector match: chunk id plus cosine distance (lower is closer).
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Chunk id.
    pub id: String,
    /// `1 - cosine similarity`.
    pub distance: f32,
}

/// SQLite-backed storage engine owning chunks, file records, the FTS5
/// lexical index and the optional vector index.
///
/// Every mutation runs inside a transaction on the single connection, and
/// readers take the same lock, so a reader sees either all or none of a
/// file's replacement.
pub struct Store {
    conn: Mutex<Option<Connection>>,
    vector_dimension: Option<usize>,
}

impl Store {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path, options: StoreOptions) -> MemdexResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(storage("failed to open database"))?;
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(storage("failed to enable WAL mode"))?;
        info!(path = %path.display(), "opened memory store");
        Self::initialize(conn, options)
    }

    /// Open an in-memory store (for tests).
    pub fn open_in_memory(options: StoreOptions) -> MemdexResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(storage("failed to create in-memory database"))?;
        Self::initialize(conn, options)
    }

    /// Store file location for a project: `<data_dir>/<slug>.sqlite`.
    pub fn path_for(data_dir: &Path, project_slug: &str) -> PathBuf {
        data_dir.join(format!("{project_slug}.sqlite"))
    }

    fn initialize(conn: Connection, options: StoreOptions) -> MemdexResult<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(storage("failed to create schema"))?;

        let vector_dimension = match options.vector_dimension {
            Some(dim) => match init_vector_index(&conn, dim) {
                Ok(()) => Some(dim),
                Err(e) => {
                    warn!(error = %e, "vector index unavailable, vector search disabled");
                    None
                }
            },
            None => {
                info!("no embedding dimension configured, vector search disabled");
                None
            }
        };

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            vector_dimension,
        })
    }

    /// Whether the vector index is active.
    pub fn is_vector_enabled(&self) -> bool {
        self.vector_dimension.is_some()
    }

    /// Dimension of the vector index, if enabled.
    pub fn vector_dimension(&self) -> Option<usize> {
        self.vector_dimension
    }

    /// Close the underlying connection. Every later call fails with
    /// [`MemdexError::NotInitialized`].
    pub fn close(&self) -> MemdexResult<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| MemdexError::Storage(format!("failed to close database: {e}")))?;
            debug!("memory store closed");
        }
        Ok(())
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> MemdexResult<R>,
    ) -> MemdexResult<R> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| MemdexError::NotInitialized("memory store is closed".to_string()))?;
        f(conn)
    }

    /// Run `f` against a consistent snapshot. No write can interleave with
    /// the reads performed inside the closure.
    pub fn read<R>(&self, f: impl FnOnce(&Snapshot<'_>) -> MemdexResult<R>) -> MemdexResult<R> {
        self.with_conn(|conn| {
            f(&Snapshot {
                conn: &*conn,
                vector_dimension: self.vector_dimension,
            })
        })
    }

    // --- Chunks ---

    /// Insert or overwrite chunks by id, keeping the lexical and vector
    /// entries in lock-step. All-or-nothing.
    pub fn upsert_chunks(&self, path: &str, chunks: &[NewChunk]) -> MemdexResult<()> {
        self.with_conn(|conn| {
            let tx = begin(conn)?;
            write_chunks(&tx, path, chunks, self.vector_dimension)?;
            commit(tx)
        })
    }

    /// Remove every chunk of `path` along with its lexical and vector
    /// entries. No-op for unknown paths.
    pub fn delete_chunks_by_path(&self, path: &str) -> MemdexResult<usize> {
        self.with_conn(|conn| {
            let tx = begin(conn)?;
            let removed = delete_path_chunks(&tx, path, self.vector_dimension.is_some())?;
            commit(tx)?;
            Ok(removed)
        })
    }

    /// Replace a file's chunks and record in one transaction.
    pub fn replace_file(&self, record: &FileRecord, chunks: &[NewChunk]) -> MemdexResult<()> {
        self.with_conn(|conn| {
            let tx = begin(conn)?;
            delete_path_chunks(&tx, &record.path, self.vector_dimension.is_some())?;
            write_chunks(&tx, &record.path, chunks, self.vector_dimension)?;
            write_file(&tx, record)?;
            commit(tx)
        })
    }

    /// Remove a file's chunks and record in one transaction. Returns whether
    /// anything was stored for the path.
    pub fn remove_file(&self, path: &str) -> MemdexResult<bool> {
        self.with_conn(|conn| {
            let tx = begin(conn)?;
            let chunks = delete_path_chunks(&tx, path, self.vector_dimension.is_some())?;
            let files = tx
                .execute("DELETE FROM files WHERE path = ?1", params![path])
                .map_err(storage("failed to delete file record"))?;
            commit(tx)?;
            Ok(chunks > 0 || files > 0)
        })
    }

    /// All chunks of `path`, in line order.
    pub fn get_chunks_by_path(&self, path: &str) -> MemdexResult<Vec<Chunk>> {
        self.read(|s| s.get_chunks_by_path(path))
    }

    /// One chunk by id.
    pub fn get_chunk_by_id(&self, id: &str) -> MemdexResult<Option<Chunk>> {
        self.read(|s| s.get_chunk_by_id(id))
    }

    /// FTS5 search, best match first; see [`Snapshot::search_lexical`].
    pub fn search_lexical(&self, query: &str, limit: usize) -> MemdexResult<Vec<LexicalHit>> {
        self.read(|s| s.search_lexical(query, limit))
    }

    /// Nearest chunks by cosine distance; see [`Snapshot::search_vector`].
    pub fn search_vector(&self, query: &[f32], limit: usize) -> MemdexResult<Vec<VectorHit>> {
        self.read(|s| s.search_vector(query, limit))
    }

    // --- Files ---

    /// Insert or replace one file record.
    pub fn upsert_file(&self, record: &FileRecord) -> MemdexResult<()> {
        self.with_conn(|conn| write_file(conn, record))
    }

    /// The record for `path`, if indexed.
    pub fn get_file(&self, path: &str) -> MemdexResult<Option<FileRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT path, hash, mtime, size, model FROM files WHERE path = ?1",
                params![path],
                row_to_file,
            )
            .optional()
            .map_err(storage("failed to query file record"))
        })
    }

    /// Every file record, ordered by path.
    pub fn get_all_files(&self) -> MemdexResult<Vec<FileRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT path, hash, mtime, size, model FROM files ORDER BY path")
                .map_err(storage("failed to prepare file listing"))?;
            let rows = stmt
                .query_map([], row_to_file)
                .map_err(storage("failed to list files"))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(storage("failed to read file row"))
        })
    }

    /// Delete the record for `path`, leaving its chunks.
    pub fn delete_file(&self, path: &str) -> MemdexResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM files WHERE path = ?1", params![path])
                .map_err(storage("failed to delete file record"))?;
            Ok(())
        })
    }

    // --- Introspection ---

    /// Aggregate counts and capability flags. Side-effect free.
    pub fn get_stats(&self) -> MemdexResult<StoreStats> {
        self.with_conn(|conn| {
            let chunks: i64 = conn
                .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                .map_err(storage("failed to count chunks"))?;
            let files: i64 = conn
                .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
                .map_err(storage("failed to count files"))?;
            let db_size: i64 = conn
                .query_row(
                    "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                    [],
                    |row| row.get(0),
                )
                .map_err(storage("failed to get database size"))?;
            Ok(StoreStats {
                chunks: chunks as usize,
                files: files as usize,
                db_size_bytes: db_size.max(0) as u64,
                vector_enabled: self.vector_dimension.is_some(),
                lexical_enabled: true,
            })
        })
    }

    /// Names of all tables and views, sorted.
    pub fn table_names(&self) -> MemdexResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name",
                )
                .map_err(storage("failed to prepare table listing"))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(storage("failed to list tables"))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(storage("failed to read table name"))
        })
    }
}

/// Read-only view of the store while its lock is held.
pub struct Snapshot<'a> {
    conn: &'a Connection,
    vector_dimension: Option<usize>,
}

impl Snapshot<'_> {
    /// One chunk by id.
    pub fn get_chunk_by_id(&self, id: &str) -> MemdexResult<Option<Chunk>> {
        self.conn
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"),
                params![id],
                row_to_chunk,
            )
            .optional()
            .map_err(storage("failed to query chunk"))
    }

    /// All chunks of `path`, in line order.
    pub fn get_chunks_by_path(&self, path: &str) -> MemdexResult<Vec<Chunk>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE path = ?1 ORDER BY start_line"
            ))
            .map_err(storage("failed to prepare chunk query"))?;
        let rows = stmt
            .query_map(params![path], row_to_chunk)
            .map_err(storage("failed to query chunks by path"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(storage("failed to read chunk row"))
    }

    /// Chunk ids ranked by FTS5 BM25 relevance, best first.
    ///
    /// The query is reduced to quoted alphanumeric terms joined with `OR`, so
    /// user input can never form invalid FTS5 syntax. An empty query, or any
    /// residual engine error, yields an empty list.
    pub fn search_lexical(&self, query: &str, limit: usize) -> MemdexResult<Vec<LexicalHit>> {
        let expr = fts_query(query);
        if expr.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let result: rusqlite::Result<Vec<LexicalHit>> = (|| {
            let mut stmt = self.conn.prepare(
                "SELECT id, rank FROM chunks_fts WHERE chunks_fts MATCH ?1 ORDER BY rank LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![expr, limit as i64], |row| {
                Ok(LexicalHit {
                    id: row.get(0)?,
                    rank: row.get(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })();
        match result {
            Ok(hits) => Ok(hits),
            Err(e) => {
                warn!(error = %e, query = %expr, "lexical query failed, returning no results");
                Ok(Vec::new())
            }
        }
    }

    /// Chunk ids ranked by ascending cosine distance to `query`.
    ///
    /// Returns an empty list when the vector index is disabled.
    pub fn search_vector(&self, query: &[f32], limit: usize) -> MemdexResult<Vec<VectorHit>> {
        let Some(dim) = self.vector_dimension else {
            return Ok(Vec::new());
        };
        if query.len() != dim {
            return Err(MemdexError::Embedding(format!(
                "query vector has dimension {}, index expects {dim}",
                query.len()
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare("SELECT id, embedding FROM chunks_vec")
            .map_err(storage("failed to prepare vector scan"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(storage("failed to scan vectors"))?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, blob) = row.map_err(storage("failed to read vector row"))?;
            let embedding = decode_embedding(&blob);
            if embedding.len() != dim {
                continue;
            }
            let distance = 1.0 - cosine_similarity(query, &embedding);
            hits.push(VectorHit { id, distance });
        }

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

// --- Helpers ---

fn storage(context: &'static str) -> impl Fn(rusqlite::Error) -> MemdexError {
    move |e| MemdexError::Storage(format!("{context}: {e}"))
}

fn begin(conn: &mut Connection) -> MemdexResult<Transaction<'_>> {
    conn.transaction()
        .map_err(storage("failed to start transaction"))
}

fn commit(tx: Transaction<'_>) -> MemdexResult<()> {
    tx.commit().map_err(storage("failed to commit transaction"))
}

fn init_vector_index(conn: &Connection, dim: usize) -> MemdexResult<()> {
    conn.execute_batch(VECTOR_SQL)
        .map_err(storage("failed to create vector table"))?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'vector_dimension'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage("failed to read vector dimension"))?;

    let dim_str = dim.to_string();
    if stored.as_deref() != Some(dim_str.as_str()) {
        if let Some(previous) = stored {
            warn!(
                previous = %previous,
                current = dim,
                "embedding dimension changed, dropping stored vectors"
            );
        }
        conn.execute("DELETE FROM chunks_vec", [])
            .map_err(storage("failed to clear vector table"))?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('vector_dimension', ?1)",
            params![dim_str],
        )
        .map_err(storage("failed to record vector dimension"))?;
    }

    // Vectors written while the index was disabled can be orphaned.
    conn.execute(
        "DELETE FROM chunks_vec WHERE id NOT IN (SELECT id FROM chunks)",
        [],
    )
    .map_err(storage("failed to prune orphaned vectors"))?;

    debug!(dimension = dim, "vector index ready");
    Ok(())
}

fn write_chunks(
    tx: &Transaction<'_>,
    path: &str,
    chunks: &[NewChunk],
    vector_dimension: Option<usize>,
) -> MemdexResult<()> {
    let now = Utc::now().timestamp_millis();

    let mut upsert = tx
        .prepare_cached(
            "INSERT OR REPLACE INTO chunks (id, path, text, start_line, end_line, hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .map_err(storage("failed to prepare chunk upsert"))?;
    let mut fts_delete = tx
        .prepare_cached("DELETE FROM chunks_fts WHERE id = ?1")
        .map_err(storage("failed to prepare lexical delete"))?;
    let mut fts_insert = tx
        .prepare_cached("INSERT INTO chunks_fts (text, id, path) VALUES (?1, ?2, ?3)")
        .map_err(storage("failed to prepare lexical insert"))?;

    for chunk in chunks {
        upsert
            .execute(params![
                chunk.id,
                path,
                chunk.text,
                chunk.start_line as i64,
                chunk.end_line as i64,
                chunk.hash,
                now,
            ])
            .map_err(storage("failed to upsert chunk"))?;

        // FTS5 rows cannot be updated in place.
        fts_delete
            .execute(params![chunk.id])
            .map_err(storage("failed to delete lexical entry"))?;
        fts_insert
            .execute(params![chunk.text, chunk.id, path])
            .map_err(storage("failed to insert lexical entry"))?;

        if let Some(dim) = vector_dimension {
            tx.execute("DELETE FROM chunks_vec WHERE id = ?1", params![chunk.id])
                .map_err(storage("failed to delete vector entry"))?;
            if let Some(embedding) = &chunk.embedding {
                if embedding.len() != dim {
                    return Err(MemdexError::Embedding(format!(
                        "chunk {} has embedding dimension {}, index expects {dim}",
                        chunk.id,
                        embedding.len()
                    )));
                }
                tx.execute(
                    "INSERT INTO chunks_vec (id, embedding) VALUES (?1, ?2)",
                    params![chunk.id, encode_embedding(embedding)],
                )
                .map_err(storage("failed to insert vector entry"))?;
            }
        }
    }
    Ok(())
}

fn delete_path_chunks(
    tx: &Transaction<'_>,
    path: &str,
    vector_enabled: bool,
) -> MemdexResult<usize> {
    tx.execute(
        "DELETE FROM chunks_fts WHERE id IN (SELECT id FROM chunks WHERE path = ?1)",
        params![path],
    )
    .map_err(storage("failed to delete lexical entries"))?;
    if vector_enabled {
        tx.execute(
            "DELETE FROM chunks_vec WHERE id IN (SELECT id FROM chunks WHERE path = ?1)",
            params![path],
        )
        .map_err(storage("failed to delete vector entries"))?;
    }
    tx.execute("DELETE FROM chunks WHERE path = ?1", params![path])
        .map_err(storage("failed to delete chunks"))
}

fn write_file(conn: &Connection, record: &FileRecord) -> MemdexResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO files (path, hash, mtime, size, model) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.path,
            record.hash,
            record.mtime,
            record.size as i64,
            record.model,
        ],
    )
    .map_err(storage("failed to upsert file record"))?;
    Ok(())
}

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let updated_ms: i64 = row.get(6)?;
    Ok(Chunk {
        id: row.get(0)?,
        path: row.get(1)?,
        text: row.get(2)?,
        start_line: row.get::<_, i64>(3)? as usize,
        end_line: row.get::<_, i64>(4)? as usize,
        hash: row.get(5)?,
        updated_at: DateTime::<Utc>::from_timestamp_millis(updated_ms).unwrap_or_default(),
    })
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        path: row.get(0)?,
        hash: row.get(1)?,
        mtime: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        model: row.get(4)?,
    })
}

/// Build a safe FTS5 MATCH expression: every alphanumeric term quoted,
/// joined with `OR` so partial matches still rank.
fn fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity between two vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
