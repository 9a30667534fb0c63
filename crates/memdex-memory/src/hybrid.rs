use std::sync::Arc;

use memdex_core::MemdexResult;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::{truncate_for_embedding, Embeddings};
use crate::fusion::{reciprocal_rank_fusion, FusionWeights};
use crate::store::Store;

/// Query embeddings are cut to this many characters.
const MAX_QUERY_CHARS: usize = 8000;

/// A ranked chunk, complete enough that callers need no second lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Chunk id, usable with `get_chunk`.
    pub id: String,
    /// File path relative to the memory root.
    pub path: String,
    /// Chunk text.
    pub text: String,
    /// First line, 1-based.
    pub start_line: usize,
    /// Last line, inclusive.
    pub end_line: usize,
    /// Fused RRF score (higher is better).
    pub score: f32,
    /// 1-based rank in the lexical leg.
    pub lexical_rank: Option<usize>,
    /// 1-based rank in the vector leg.
    pub vector_rank: Option<usize>,
}

/// Hybrid searcher that combines FTS5 keyword search with vector search
/// using Reciprocal Rank Fusion (RRF).
///
/// This provides better recall than either method alone:
/// - Vector search captures semantic similarity (meaning)
/// - Keyword search captures exact term matches (lexical)
///
/// Without an embedding provider, or with the store's vector index
/// disabled, only the lexical leg runs and its order is returned as is.
pub struct HybridSearcher {
    store: Arc<Store>,
    embeddings: Embeddings,
    weights: FusionWeights,
}

impl HybridSearcher {
    /// Create a new hybrid searcher with equal weights and rrf_k=60.0.
    pub fn new(store: Arc<Store>, embeddings: Embeddings) -> Self {
        Self {
            store,
            embeddings,
            weights: FusionWeights::default(),
        }
    }

    /// Override the fusion weights. Chainable builder method.
    pub fn with_weights(mut self, weights: FusionWeights) -> Self {
        self.weights = FusionWeights {
            keyword_weight: weights.keyword_weight.max(0.0),
            vector_weight: weights.vector_weight.max(0.0),
            rrf_k: weights.rrf_k.max(0.0),
        };
        self
    }

    /// Whether searches currently run the vector leg.
    pub fn is_vector_active(&self) -> bool {
        self.embeddings.is_available() && self.store.is_vector_enabled()
    }

    /// Search both indexes and fuse the rankings into at most `limit`
    /// results.
    ///
    /// Each leg fetches `limit * 3` candidates for better overlap. Both legs
    /// and the hydration of result rows run against one store snapshot, so
    /// a concurrent re-index is seen either entirely or not at all. An empty
    /// query yields no results.
    pub async fn search(&self, query: &str, limit: usize) -> MemdexResult<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let fetch_k = limit.saturating_mul(3).max(limit);

        // Embedding happens before the snapshot so the lock is never held
        // across an await.
        let query_embedding = self.embed_query(query).await;

        self.store.read(|snapshot| {
            let lexical: Vec<String> = snapshot
                .search_lexical(query, fetch_k)?
                .into_iter()
                .map(|hit| hit.id)
                .collect();

            let vector: Vec<String> = match &query_embedding {
                Some(embedding) => match snapshot.search_vector(embedding, fetch_k) {
                    // Orthogonal or opposite vectors carry no signal.
                    Ok(hits) => hits
                        .into_iter()
                        .filter(|hit| hit.distance < 1.0)
                        .map(|hit| hit.id)
                        .collect(),
                    Err(e) => {
                        warn!(error = %e, "vector search failed, using lexical results only");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };

            let fused = reciprocal_rank_fusion(&lexical, &vector, self.weights, limit);
            debug!(
                query = %query,
                lexical = lexical.len(),
                vector = vector.len(),
                fused = fused.len(),
                "hybrid search"
            );

            let mut results = Vec::with_capacity(fused.len());
            for hit in fused {
                // Snapshot reads cannot race a delete, so a miss means an
                // orphaned index entry; skip it.
                let Some(chunk) = snapshot.get_chunk_by_id(&hit.id)? else {
                    warn!(id = %hit.id, "index entry without chunk row");
                    continue;
                };
                results.push(SearchResult {
                    id: chunk.id,
                    path: chunk.path,
                    text: chunk.text,
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    score: hit.score,
                    lexical_rank: hit.lexical_rank,
                    vector_rank: hit.vector_rank,
                });
            }
            Ok(results)
        })
    }

    /// Query vector, or `None` when the vector leg should be skipped.
    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        if !self.is_vector_active() {
            return None;
        }
        match self
            .embeddings
            .embed(truncate_for_embedding(query, MAX_QUERY_CHARS))
            .await
        {
            Ok(v) if v.iter().any(|x| *x != 0.0) => Some(v),
            Ok(_) => {
                debug!("query embedding is zero, skipping vector search");
                None
            }
            Err(e) => {
                warn!(error = %e, "query embedding failed, using lexical results only");
                None
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, LocalEmbedding};
    use crate::store::StoreOptions;
    use async_trait::async_trait;
    use memdex_core::{MemdexError, NewChunk};

    const DIM: usize = 64;

    async fn chunk(id: &str, text: &str, embed: bool) -> NewChunk {
        let embedding = if embed {
            Some(LocalEmbedding::new(DIM).embed(text).await.unwrap())
        } else {
            None
        };
        NewChunk {
            id: id.to_string(),
            text: text.to_string(),
            start_line: 1,
            end_line: 1,
            hash: format!("h-{id}"),
            embedding,
        }
    }

    async fn make_searcher(embed: bool) -> (Arc<Store>, HybridSearcher) {
        let store = Arc::new(
            Store::open_in_memory(StoreOptions {
                vector_dimension: Some(DIM),
            })
            .unwrap(),
        );
        let embeddings = if embed {
            Embeddings::init(Arc::new(LocalEmbedding::new(DIM))).await
        } else {
            Embeddings::disabled()
        };
        let searcher = HybridSearcher::new(store.clone(), embeddings);
        (store, searcher)
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let (store, searcher) = make_searcher(true).await;
        store
            .upsert_chunks("a.md", &[chunk("a", "anything", true).await])
            .unwrap();
        assert!(searcher.search("", 10).await.unwrap().is_empty());
        assert!(searcher.search("   \t", 10).await.unwrap().is_empty());
        assert!(searcher.search("anything", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_are_hydrated() {
        let (store, searcher) = make_searcher(true).await;
        store
            .upsert_chunks(
                "notes/auth.md",
                &[chunk("auth", "authentication uses JWT tokens", true).await],
            )
            .unwrap();

        let results = searcher.search("authentication", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        let hit = &results[0];
        assert_eq!(hit.id, "auth");
        assert_eq!(hit.path, "notes/auth.md");
        assert_eq!(hit.text, "authentication uses JWT tokens");
        assert_eq!(hit.lexical_rank, Some(1));
        assert_eq!(hit.vector_rank, Some(1));
        assert!(hit.score > 0.0);
    }

    #[tokio::test]
    async fn test_keyword_match_outranks_unrelated() {
        let (store, searcher) = make_searcher(true).await;
        store
            .upsert_chunks(
                "a.md",
                &[
                    chunk("rust", "rust memory safety guaranteed by the compiler", true).await,
                    chunk("cake", "chocolate cake recipe with frosting", true).await,
                ],
            )
            .unwrap();

        let results = searcher.search("rust compiler", 10).await.unwrap();
        assert_eq!(results[0].id, "rust");
        if let Some(pos) = results.iter().position(|r| r.id == "cake") {
            assert!(pos > 0);
        }
    }

    #[tokio::test]
    async fn test_lexical_only_mode_returns_lexical_order() {
        let (store, searcher) = make_searcher(false).await;
        assert!(!searcher.is_vector_active());
        store
            .upsert_chunks(
                "a.md",
                &[
                    chunk("weak", "kubernetes appears once here among many other words", false)
                        .await,
                    chunk("strong", "kubernetes kubernetes kubernetes", false).await,
                ],
            )
            .unwrap();

        let lexical: Vec<String> = store
            .search_lexical("kubernetes", 30)
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        let results = searcher.search("kubernetes", 10).await.unwrap();
        let fused: Vec<String> = results.iter().map(|r| r.id.clone()).collect();
        assert_eq!(fused, lexical);
        assert!(results.iter().all(|r| r.vector_rank.is_none()));
    }

    struct BrokenAfterInit;

    #[async_trait]
    impl EmbeddingProvider for BrokenAfterInit {
        async fn embed(&self, _text: &str) -> MemdexResult<Vec<f32>> {
            Err(MemdexError::Embedding("backend went away".to_string()))
        }
        fn dimension(&self) -> usize {
            DIM
        }
        fn model_name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_lexical() {
        let store = Arc::new(
            Store::open_in_memory(StoreOptions {
                vector_dimension: Some(DIM),
            })
            .unwrap(),
        );
        store
            .upsert_chunks("a.md", &[chunk("a", "fallback works", true).await])
            .unwrap();
        let embeddings = Embeddings::init(Arc::new(BrokenAfterInit)).await;
        let searcher = HybridSearcher::new(store, embeddings);

        let results = searcher.search("fallback", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].vector_rank, None);
    }

    #[tokio::test]
    async fn test_limit_is_respected() {
        let (store, searcher) = make_searcher(true).await;
        let mut chunks = Vec::new();
        for i in 0..10 {
            chunks.push(chunk(&format!("c{i}"), &format!("shared term number {i}"), true).await);
        }
        store.upsert_chunks("a.md", &chunks).unwrap();
        assert_eq!(searcher.search("shared term", 3).await.unwrap().len(), 3);
    }
}
