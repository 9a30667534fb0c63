use std::path::{Path, PathBuf};
use std::sync::Arc;

use memdex_core::{Chunk, MemdexError, MemdexResult};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::{EmbeddingBackend, EmbeddingConfig, MemoryConfig};
use crate::embedding::{Embeddings, LocalEmbedding};
use crate::fusion::FusionWeights;
use crate::hybrid::{HybridSearcher, SearchResult};
use crate::indexer::{FileOutcome, IndexReport, Indexer};
use crate::store::{Store, StoreOptions};
use crate::watcher::{MemoryWatcher, WatcherOptions};

const MAX_WRITE_SIZE: usize = 1024 * 1024; // 1MB

/// Side-effect-free snapshot of what the service can do right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStatus {
    /// Absolute memory root.
    pub memory_root: PathBuf,
    /// Database file, `None` for an in-memory store.
    pub store_path: Option<PathBuf>,
    /// Indexed files.
    pub files: usize,
    /// Indexed chunks.
    pub chunks: usize,
    /// Database size on disk.
    pub db_size_bytes: u64,
    /// Whether the store keeps vectors.
    pub vector_enabled: bool,
    /// Whether the FTS5 index is available.
    pub lexical_enabled: bool,
    /// Whether the embedding backend initialised.
    pub embeddings_available: bool,
    /// Model name of the embedding backend.
    pub embedding_model: Option<String>,
    /// Whether a watcher is running.
    pub watching: bool,
}

/// Result of [`MemoryService::write`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteReport {
    /// Normalised path relative to the memory root.
    pub path: String,
    /// Bytes written by this call.
    pub bytes_written: usize,
    /// Whether the content was appended.
    pub append: bool,
    /// What indexing the written file did.
    pub outcome: FileOutcome,
}

/// Entry point for a host process: owns the store, the indexer, the
/// searcher and, while watching, the file watcher.
///
/// Shut down with [`MemoryService::shutdown`]; it stops the watcher before
/// closing the store so no write is cut off.
pub struct MemoryService {
    config: MemoryConfig,
    store_path: Option<PathBuf>,
    store: Arc<Store>,
    indexer: Arc<Indexer>,
    searcher: HybridSearcher,
    watcher: tokio::sync::Mutex<Option<MemoryWatcher>>,
}

impl MemoryService {
    /// Open the persisted store for `config.project` and initialise the
    /// configured embedding backend. The memory root is created if missing.
    pub async fn open(mut config: MemoryConfig) -> MemdexResult<Self> {
        config.memory_root = std::path::absolute(&config.memory_root)?;
        tokio::fs::create_dir_all(&config.memory_root).await?;

        let embeddings = build_embeddings(&config.embedding).await;
        let store_path = config.store_path();
        let store = Store::open(
            &store_path,
            StoreOptions {
                vector_dimension: embeddings.dimension(),
            },
        )?;

        let mut service = Self::with_store(config, Arc::new(store), embeddings);
        service.store_path = Some(store_path);
        Ok(service)
    }

    /// Assemble a service around an already opened store.
    pub fn with_store(config: MemoryConfig, store: Arc<Store>, embeddings: Embeddings) -> Self {
        let searcher = HybridSearcher::new(store.clone(), embeddings.clone()).with_weights(
            FusionWeights {
                keyword_weight: config.keyword_weight,
                vector_weight: config.vector_weight,
                rrf_k: config.rrf_k,
            },
        );
        let indexer = Arc::new(Indexer::new(config.clone(), store.clone(), embeddings));
        Self {
            config,
            store_path: None,
            store,
            indexer,
            searcher,
            watcher: tokio::sync::Mutex::new(None),
        }
    }

    /// Effective configuration, with the root made absolute.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The shared indexer.
    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Hybrid search; see [`HybridSearcher::search`].
    pub async fn search(&self, query: &str, limit: usize) -> MemdexResult<Vec<SearchResult>> {
        self.searcher.search(query, limit).await
    }

    /// One chunk by id.
    pub fn get_chunk(&self, id: &str) -> MemdexResult<Option<Chunk>> {
        self.store.get_chunk_by_id(id)
    }

    /// All chunks of one file, in line order.
    pub fn get_file_chunks(&self, path: &str) -> MemdexResult<Vec<Chunk>> {
        let rel = self.indexer.relative_path(Path::new(path))?;
        self.store.get_chunks_by_path(&rel)
    }

    /// Full reconciliation pass; see [`Indexer::index_all`].
    pub async fn index_all(&self) -> MemdexResult<IndexReport> {
        self.indexer.index_all().await
    }

    /// Reconcile one path; see [`Indexer::index_file`].
    pub async fn index_file(&self, path: &Path) -> MemdexResult<FileOutcome> {
        self.indexer.index_file(path).await
    }

    /// Write (or append to) a memory file and index it right away.
    ///
    /// `path` must stay inside the memory root, must not pass through a
    /// hidden directory, and must carry a recognised extension.
    pub async fn write(
        &self,
        path: &str,
        content: &str,
        append: bool,
    ) -> MemdexResult<WriteReport> {
        if content.len() > MAX_WRITE_SIZE {
            return Err(MemdexError::InvalidInput(format!(
                "content too large: {} bytes (max: {MAX_WRITE_SIZE} bytes)",
                content.len()
            )));
        }

        let rel = self.indexer.relative_path(Path::new(path))?;
        if rel.split('/').any(|part| part.starts_with('.')) {
            return Err(MemdexError::InvalidInput(format!(
                "hidden paths are not indexed: '{rel}'"
            )));
        }
        let target = rel
            .split('/')
            .fold(self.config.memory_root.clone(), |acc, part| acc.join(part));
        if !self.config.is_recognized(&target) {
            return Err(MemdexError::InvalidInput(format!(
                "unsupported file type '{rel}' (allowed: {})",
                self.config.extensions.join(", ")
            )));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if append {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
        } else {
            tokio::fs::write(&target, content).await?;
        }
        info!(path = %rel, size = content.len(), append, "memory file written");

        let outcome = self.indexer.index_file(Path::new(&rel)).await?;
        Ok(WriteReport {
            path: rel,
            bytes_written: content.len(),
            append,
            outcome,
        })
    }

    /// Counts and capability flags. Performs no writes.
    pub async fn status(&self) -> MemdexResult<MemoryStatus> {
        let stats = self.store.get_stats()?;
        let embeddings = self.indexer.embeddings();
        let watching = self
            .watcher
            .lock()
            .await
            .as_ref()
            .is_some_and(MemoryWatcher::is_running);
        Ok(MemoryStatus {
            memory_root: self.config.memory_root.clone(),
            store_path: self.store_path.clone(),
            files: stats.files,
            chunks: stats.chunks,
            db_size_bytes: stats.db_size_bytes,
            vector_enabled: stats.vector_enabled,
            lexical_enabled: stats.lexical_enabled,
            embeddings_available: embeddings.is_available(),
            embedding_model: embeddings.model_name().map(str::to_string),
            watching,
        })
    }

    /// Start the file watcher. A watcher that already runs is kept; one that
    /// stopped on its own is replaced.
    pub async fn watch(&self) -> MemdexResult<()> {
        let mut slot = self.watcher.lock().await;
        if let Some(existing) = slot.take() {
            if existing.is_running() {
                *slot = Some(existing);
                return Ok(());
            }
            existing.stop().await?;
        }
        *slot = Some(MemoryWatcher::start(
            self.indexer.clone(),
            WatcherOptions {
                debounce: self.config.debounce(),
            },
        )?);
        Ok(())
    }

    /// Stop the watcher, waiting for its in-flight indexing, then close the
    /// store. Later calls fail with [`MemdexError::NotInitialized`].
    pub async fn shutdown(&self) -> MemdexResult<()> {
        let watcher = self.watcher.lock().await.take();
        if let Some(watcher) = watcher {
            watcher.stop().await?;
        }
        self.store.close()?;
        info!("memory service shut down");
        Ok(())
    }
}

/// Initialise the configured backend. Failures degrade to lexical-only.
pub async fn build_embeddings(config: &EmbeddingConfig) -> Embeddings {
    match config.backend {
        EmbeddingBackend::None => {
            info!("embeddings disabled by configuration, lexical-only search");
            Embeddings::disabled()
        }
        EmbeddingBackend::Local => {
            Embeddings::init(Arc::new(LocalEmbedding::new(config.dimension))).await
        }
        EmbeddingBackend::Http => http_embeddings(config).await,
    }
}

#[cfg(feature = "http-embeddings")]
async fn http_embeddings(config: &EmbeddingConfig) -> Embeddings {
    use crate::embedding_http::HttpEmbedding;

    let (Some(base_url), Some(model)) = (&config.base_url, &config.model) else {
        warn!("http embedding backend needs base_url and model, lexical-only search");
        return Embeddings::disabled();
    };
    let mut provider = HttpEmbedding::new(base_url, model.clone(), config.dimension);
    if let Some(var) = &config.api_key_env {
        match std::env::var(var) {
            Ok(key) => provider = provider.with_api_key(key),
            Err(_) => warn!(
                env = %var,
                "api key variable not set, sending unauthenticated requests"
            ),
        }
    }
    Embeddings::init(Arc::new(provider)).await
}

#[cfg(not(feature = "http-embeddings"))]
async fn http_embeddings(_config: &EmbeddingConfig) -> Embeddings {
    warn!("built without the http-embeddings feature, lexical-only search");
    Embeddings::disabled()
}
