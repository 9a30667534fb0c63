#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the memdex-memory crate.
//!
//! Covers the end-to-end index/search/delete cycle, persistence across
//! restarts, hash-based skipping, atomic replacement, degraded lexical-only
//! mode, embedding model changes, and fusion ordering.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use memdex_memory::{
    reciprocal_rank_fusion, EmbeddingBackend, EmbeddingConfig, EmbeddingProvider, Embeddings,
    FileOutcome, FusionWeights, HybridSearcher, Indexer, LocalEmbedding, MemoryConfig,
    MemoryService, Store, StoreOptions,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const NOTES: &str = "\
Authentication uses JWT tokens signed by the gateway.
Tokens expire after one hour.

Workers run as kubernetes pods in the batch namespace.
";

fn config(tmp: &TempDir, backend: EmbeddingBackend, dimension: usize) -> MemoryConfig {
    MemoryConfig {
        memory_root: tmp.path().join("memory"),
        data_dir: tmp.path().join("data"),
        project: "Integration Tests".to_string(),
        embedding: EmbeddingConfig {
            backend,
            dimension,
            ..EmbeddingConfig::default()
        },
        ..MemoryConfig::default()
    }
}

async fn open_local(tmp: &TempDir) -> MemoryService {
    MemoryService::open(config(tmp, EmbeddingBackend::Local, 384))
        .await
        .unwrap()
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn chunk_ids(service: &MemoryService, path: &str) -> Vec<String> {
    service
        .get_file_chunks(path)
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect()
}

// ---------------------------------------------------------------------------
// 1. End-to-end scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_index_search_delete_recreate() {
    let tmp = TempDir::new().unwrap();
    let service = open_local(&tmp).await;
    let root = service.config().memory_root.clone();
    write(&root, "notes.md", NOTES);

    let report = service.index_all().await.unwrap();
    assert_eq!(report.files_indexed, 1);
    assert_eq!(report.chunks_written, 2);

    let results = service.search("authentication", 10).await.unwrap();
    assert!(!results.is_empty());
    assert!(results[0].text.contains("Authentication uses JWT tokens"));
    assert_eq!(results[0].path, "notes.md");
    assert_eq!((results[0].start_line, results[0].end_line), (1, 2));
    if let Some(pos) = results.iter().position(|r| r.text.contains("kubernetes")) {
        assert!(pos > 0, "kubernetes paragraph must rank below the auth paragraph");
    }

    let old_ids = chunk_ids(&service, "notes.md");
    assert_eq!(old_ids.len(), 2);

    // Delete: both chunks leave both indexes.
    std::fs::remove_file(root.join("notes.md")).unwrap();
    let report = service.index_all().await.unwrap();
    assert_eq!(report.files_removed, 1);
    let store = service.store();
    assert!(store.search_lexical("kubernetes", 10).unwrap().is_empty());
    assert!(store.search_lexical("authentication", 10).unwrap().is_empty());
    let query = LocalEmbedding::default().embed("kubernetes pods").await.unwrap();
    assert!(store.search_vector(&query, 10).unwrap().is_empty());
    for id in &old_ids {
        assert!(service.get_chunk(id).unwrap().is_none());
    }

    // Re-create with different content: new ids, old ones gone for good.
    write(&root, "notes.md", "Authentication now uses OAuth device flow.\n");
    service.index_all().await.unwrap();
    let new_ids = chunk_ids(&service, "notes.md");
    assert_eq!(new_ids.len(), 1);
    assert!(!old_ids.contains(&new_ids[0]));
    let results = service.search("authentication", 10).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].text.contains("OAuth"));

    service.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// 2. Idempotence and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn index_file_twice_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let service = open_local(&tmp).await;
    let root = service.config().memory_root.clone();
    write(&root, "a.md", NOTES);

    let first = service.index_file(Path::new("a.md")).await.unwrap();
    assert_eq!(first, FileOutcome::Indexed { chunks: 2 });
    let chunks_before = service.get_file_chunks("a.md").unwrap();
    let record_before = service.store().get_file("a.md").unwrap();

    let second = service.index_file(Path::new("a.md")).await.unwrap();
    assert_eq!(second, FileOutcome::Unchanged);
    assert_eq!(service.get_file_chunks("a.md").unwrap(), chunks_before);
    assert_eq!(service.store().get_file("a.md").unwrap(), record_before);
    assert_eq!(service.status().await.unwrap().chunks, 2);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn store_survives_restart_and_reconciles_drift() {
    let tmp = TempDir::new().unwrap();
    {
        let service = open_local(&tmp).await;
        let root = service.config().memory_root.clone();
        write(&root, "keep.md", "kept across restarts");
        write(&root, "drop.md", "deleted while offline");
        service.index_all().await.unwrap();
        service.shutdown().await.unwrap();
    }

    let service = open_local(&tmp).await;
    let root = service.config().memory_root.clone();
    std::fs::remove_file(root.join("drop.md")).unwrap();
    write(&root, "new.md", "added while offline");

    let report = service.index_all().await.unwrap();
    assert_eq!(report.files_unchanged, 1);
    assert_eq!(report.files_indexed, 1);
    assert_eq!(report.files_removed, 1);

    let status = service.status().await.unwrap();
    assert_eq!(status.files, 2);
    assert_eq!(
        status.store_path.unwrap(),
        tmp.path().join("data").join("integration-tests.sqlite")
    );

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn embedding_model_change_reembeds() {
    let tmp = TempDir::new().unwrap();
    {
        let service = MemoryService::open(config(&tmp, EmbeddingBackend::Local, 384))
            .await
            .unwrap();
        write(&service.config().memory_root, "a.md", NOTES);
        service.index_all().await.unwrap();
        service.shutdown().await.unwrap();
    }

    let service = MemoryService::open(config(&tmp, EmbeddingBackend::Local, 64))
        .await
        .unwrap();
    let report = service.index_all().await.unwrap();
    assert_eq!(report.files_indexed, 1);
    assert_eq!(
        service.store().get_file("a.md").unwrap().unwrap().model.as_deref(),
        Some("local-hash-64")
    );
    let query = LocalEmbedding::new(64).embed("kubernetes").await.unwrap();
    assert!(!service.store().search_vector(&query, 5).unwrap().is_empty());

    service.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// 3. Atomic replace
// ---------------------------------------------------------------------------

#[tokio::test]
async fn changed_file_never_yields_union_of_versions() {
    let tmp = TempDir::new().unwrap();
    let service = open_local(&tmp).await;
    let root = service.config().memory_root.clone();

    write(&root, "a.md", "one\n\ntwo\n\nthree\n\nfour");
    service.index_all().await.unwrap();
    assert_eq!(service.get_file_chunks("a.md").unwrap().len(), 4);

    write(&root, "a.md", "replacement paragraph");
    service.index_all().await.unwrap();
    let texts: Vec<String> = service
        .get_file_chunks("a.md")
        .unwrap()
        .into_iter()
        .map(|c| c.text)
        .collect();
    assert_eq!(texts, ["replacement paragraph"]);
    assert!(service.store().search_lexical("three", 10).unwrap().is_empty());

    service.shutdown().await.unwrap();
}

fn is_whole_version(texts: &mut Vec<String>) -> bool {
    texts.sort_unstable();
    *texts == ["marker one", "marker two"]
        || *texts == ["marker alpha", "marker beta", "marker gamma"]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_search_sees_old_or_new_set() {
    let tmp = TempDir::new().unwrap();
    let service = Arc::new(open_local(&tmp).await);
    let root = service.config().memory_root.clone();
    write(&root, "a.md", "marker alpha\n\nmarker beta\n\nmarker gamma");
    service.index_all().await.unwrap();

    let writer = {
        let service = service.clone();
        let root = root.clone();
        tokio::spawn(async move {
            for i in 0..40 {
                let body = if i % 2 == 0 {
                    "marker one\n\nmarker two"
                } else {
                    "marker alpha\n\nmarker beta\n\nmarker gamma"
                };
                write(&root, "a.md", body);
                service.index_file(Path::new("a.md")).await.unwrap();
            }
        })
    };

    // Blocking readers hit the store from other threads while it is written.
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let store = service.store().clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..200 {
                    let mut texts: Vec<String> = store
                        .get_chunks_by_path("a.md")
                        .unwrap()
                        .into_iter()
                        .map(|c| c.text)
                        .collect();
                    assert!(is_whole_version(&mut texts), "mixed chunk set: {texts:?}");
                }
            })
        })
        .collect();

    for _ in 0..50 {
        let mut texts: Vec<String> = service
            .search("marker", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.text)
            .collect();
        assert!(is_whole_version(&mut texts), "mixed search result: {texts:?}");
        tokio::task::yield_now().await;
    }
    for reader in readers {
        reader.await.unwrap();
    }
    writer.await.unwrap();
}

// ---------------------------------------------------------------------------
// 4. Degraded mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lexical_only_mode_still_searches() {
    let tmp = TempDir::new().unwrap();
    let service = MemoryService::open(config(&tmp, EmbeddingBackend::None, 384))
        .await
        .unwrap();
    write(&service.config().memory_root, "notes.md", NOTES);
    service.index_all().await.unwrap();

    let status = service.status().await.unwrap();
    assert!(!status.vector_enabled);
    assert!(!status.embeddings_available);
    assert_eq!(status.chunks, 2);

    let results = service.search("kubernetes", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].text.contains("kubernetes pods"));
    assert_eq!(results[0].lexical_rank, Some(1));
    assert_eq!(results[0].vector_rank, None);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_embedder_degrades_without_error() {
    struct Unavailable;

    #[async_trait::async_trait]
    impl EmbeddingProvider for Unavailable {
        async fn init(&self) -> memdex_core::MemdexResult<()> {
            Err(memdex_core::MemdexError::Embedding("no model".to_string()))
        }
        async fn embed(&self, _text: &str) -> memdex_core::MemdexResult<Vec<f32>> {
            unreachable!("embed must not run after a failed init")
        }
        fn dimension(&self) -> usize {
            8
        }
        fn model_name(&self) -> &str {
            "unavailable"
        }
    }

    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    write(&root, "a.md", "degraded but searchable");

    let embeddings = Embeddings::init(Arc::new(Unavailable)).await;
    assert!(!embeddings.is_available());
    let store = Arc::new(
        Store::open_in_memory(StoreOptions {
            vector_dimension: embeddings.dimension(),
        })
        .unwrap(),
    );
    let indexer = Indexer::new(
        MemoryConfig {
            memory_root: root,
            ..MemoryConfig::default()
        },
        store.clone(),
        embeddings.clone(),
    );
    indexer.index_all().await.unwrap();

    let searcher = HybridSearcher::new(store, embeddings);
    let results = searcher.search("searchable", 5).await.unwrap();
    assert_eq!(results.len(), 1);
}

// ---------------------------------------------------------------------------
// 5. Fusion ordering
// ---------------------------------------------------------------------------

#[test]
fn fusion_prefers_chunks_in_both_lists() {
    let fused = reciprocal_rank_fusion(
        &["a", "b", "c"],
        &["a", "d"],
        FusionWeights::default(),
        10,
    );
    assert_eq!(fused[0].id, "a");
    let b = fused.iter().find(|h| h.id == "b").unwrap();
    assert!(fused[0].score > b.score);
}

// ---------------------------------------------------------------------------
// 6. Write path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_then_search_then_watch_picks_up_edits() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp, EmbeddingBackend::Local, 384);
    cfg.debounce_ms = 50;
    let service = MemoryService::open(cfg).await.unwrap();

    service
        .write("journal/today.md", "deployed the search service", false)
        .await
        .unwrap();
    let results = service.search("deployed", 5).await.unwrap();
    assert_eq!(results[0].path, "journal/today.md");

    service.watch().await.unwrap();
    let target = service.config().memory_root.join("journal").join("today.md");
    std::fs::write(&target, "rolled back the search service").unwrap();

    let mut updated = false;
    for _ in 0..100 {
        if !service.search("rolled", 5).await.unwrap().is_empty() {
            updated = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(updated, "watcher should re-index the edited file");
    assert!(service
        .store()
        .search_lexical("deployed", 5)
        .unwrap()
        .is_empty());

    service.shutdown().await.unwrap();
}
