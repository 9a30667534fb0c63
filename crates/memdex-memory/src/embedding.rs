use async_trait::async_trait;
use memdex_core::{MemdexError, MemdexResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Trait for computing text embeddings (vector representations).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Load the model or connect to the backend. Called once before any
    /// `embed`; failure leaves the provider unusable.
    async fn init(&self) -> MemdexResult<()> {
        Ok(())
    }

    /// Compute embedding vector for a single text.
    async fn embed(&self, text: &str) -> MemdexResult<Vec<f32>>;

    /// Compute embeddings for a batch of texts.
    async fn embed_batch(&self, texts: &[&str]) -> MemdexResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Dimension of the embedding vectors produced by this provider.
    fn dimension(&self) -> usize;

    /// Identifier recorded with indexed files; a change forces re-embedding.
    fn model_name(&self) -> &str;
}

/// Availability-checked handle to an embedding provider.
///
/// Built once at startup with [`Embeddings::init`]. When the provider is
/// missing or failed to initialise, [`Embeddings::is_available`] is false and
/// callers take the lexical-only path; calling [`Embeddings::embed`] anyway is
/// a programming error and fails with [`MemdexError::NotInitialized`].
#[derive(Clone)]
pub struct Embeddings {
    provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl Embeddings {
    /// Initialise `provider`. Failure is logged once and degrades to an
    /// unavailable handle; it is never retried.
    pub async fn init(provider: Arc<dyn EmbeddingProvider>) -> Self {
        match provider.init().await {
            Ok(()) => {
                info!(
                    model = provider.model_name(),
                    dimension = provider.dimension(),
                    "embedding provider ready"
                );
                Self {
                    provider: Some(provider),
                }
            }
            Err(e) => {
                warn!(
                    model = provider.model_name(),
                    error = %e,
                    "embedding provider unavailable, falling back to lexical-only search"
                );
                Self { provider: None }
            }
        }
    }

    /// Lexical-only mode.
    pub fn disabled() -> Self {
        Self { provider: None }
    }

    /// Whether a provider initialised successfully.
    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// Model name, if available.
    pub fn model_name(&self) -> Option<&str> {
        self.provider.as_deref().map(|p| p.model_name())
    }

    /// Embedding dimension, if available.
    pub fn dimension(&self) -> Option<usize> {
        self.provider.as_deref().map(|p| p.dimension())
    }

    fn provider(&self) -> MemdexResult<&dyn EmbeddingProvider> {
        self.provider.as_deref().ok_or_else(|| {
            MemdexError::NotInitialized("embedding provider is not available".to_string())
        })
    }

    /// Embed one text, validating the output dimension.
    pub async fn embed(&self, text: &str) -> MemdexResult<Vec<f32>> {
        let provider = self.provider()?;
        let vector = provider.embed(text).await?;
        check_dimension(provider, &vector)?;
        Ok(vector)
    }

    /// Embed a batch of texts, validating count and dimensions.
    pub async fn embed_batch(&self, texts: &[&str]) -> MemdexResult<Vec<Vec<f32>>> {
        let provider = self.provider()?;
        let vectors = provider.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(MemdexError::Embedding(format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        for vector in &vectors {
            check_dimension(provider, vector)?;
        }
        Ok(vectors)
    }
}

fn check_dimension(provider: &dyn EmbeddingProvider, vector: &[f32]) -> MemdexResult<()> {
    if vector.len() == provider.dimension() {
        Ok(())
    } else {
        Err(MemdexError::Embedding(format!(
            "{} returned dimension {}, expected {}",
            provider.model_name(),
            vector.len(),
            provider.dimension()
        )))
    }
}

/// Truncate `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_for_embedding(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Local bag-of-words embedding (no external model needed).
/// Uses TF-based sparse-to-dense mapping with a fixed dimension.
pub struct LocalEmbedding {
    dimension: usize,
    model_name: String,
}

impl LocalEmbedding {
    /// Embedder producing `dimension`-sized vectors.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_name: format!("local-hash-{dimension}"),
        }
    }
}

impl Default for LocalEmbedding {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    async fn init(&self) -> MemdexResult<()> {
        if self.dimension == 0 {
            return Err(MemdexError::Embedding(
                "embedding dimension must be positive".to_string(),
            ));
        }
        Ok(())
    }

    async fn embed(&self, text: &str) -> MemdexResult<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];

        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 1)
            .collect();

        let mut freq: HashMap<&str, f32> = HashMap::new();
        for word in &words {
            *freq.entry(word).or_insert(0.0) += 1.0;
        }

        // Text without indexable words embeds to the zero vector.
        let total = words.len() as f32;
        if total == 0.0 {
            return Ok(vector);
        }

        // Several hash positions per word for better distribution.
        for (word, count) in &freq {
            let tf = count / total;
            let hash1 = simple_hash(word.as_bytes()) as usize;
            let hash2 = simple_hash(&[word.as_bytes(), &[1u8]].concat()) as usize;
            let hash3 = simple_hash(&[word.as_bytes(), &[2u8]].concat()) as usize;

            vector[hash1 % self.dimension] += tf;
            vector[hash2 % self.dimension] += tf * 0.7;
            vector[hash3 % self.dimension] += tf * 0.5;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Simple deterministic hash function (FNV-1a).
fn simple_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn init(&self) -> MemdexResult<()> {
            Err(MemdexError::Embedding("model file missing".to_string()))
        }
        async fn embed(&self, _text: &str) -> MemdexResult<Vec<f32>> {
            unreachable!("embed must not be called on a failed provider")
        }
        fn dimension(&self) -> usize {
            4
        }
        fn model_name(&self) -> &str {
            "failing"
        }
    }

    struct WrongDimension;

    #[async_trait]
    impl EmbeddingProvider for WrongDimension {
        async fn embed(&self, _text: &str) -> MemdexResult<Vec<f32>> {
            Ok(vec![1.0; 3])
        }
        fn dimension(&self) -> usize {
            4
        }
        fn model_name(&self) -> &str {
            "wrong"
        }
    }

    #[tokio::test]
    async fn test_local_embedding_dimension() {
        let emb = LocalEmbedding::new(128);
        assert_eq!(emb.dimension(), 128);
        assert_eq!(emb.model_name(), "local-hash-128");
        let vec = emb.embed("hello world").await.unwrap();
        assert_eq!(vec.len(), 128);
    }

    #[tokio::test]
    async fn test_local_embedding_normalized() {
        let emb = LocalEmbedding::default();
        let vec = emb.embed("the quick brown fox jumps").await.unwrap();
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_local_embedding_similar_texts() {
        let emb = LocalEmbedding::default();
        let v1 = emb.embed("rust programming language").await.unwrap();
        let v2 = emb.embed("rust programming systems").await.unwrap();
        let v3 = emb.embed("cooking recipes for dinner").await.unwrap();

        let sim_12 = cosine_similarity(&v1, &v2);
        let sim_13 = cosine_similarity(&v1, &v3);
        assert!(
            sim_12 > sim_13,
            "sim(rust-rust)={sim_12} should be > sim(rust-cooking)={sim_13}"
        );
    }

    #[tokio::test]
    async fn test_local_embedding_empty_is_zero_vector() {
        let emb = LocalEmbedding::new(16);
        let vec = emb.embed("").await.unwrap();
        assert_eq!(vec, vec![0.0; 16]);
    }

    #[tokio::test]
    async fn test_local_embedding_deterministic() {
        let emb = LocalEmbedding::default();
        let v1 = emb.embed("test input").await.unwrap();
        let v2 = emb.embed("test input").await.unwrap();
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn test_embeddings_available_after_init() {
        let embeddings = Embeddings::init(Arc::new(LocalEmbedding::default())).await;
        assert!(embeddings.is_available());
        assert_eq!(embeddings.dimension(), Some(384));
        assert_eq!(embeddings.model_name(), Some("local-hash-384"));

        let vecs = embeddings.embed_batch(&["hello", "world"]).await.unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[0].len(), 384);
    }

    #[tokio::test]
    async fn test_failed_init_degrades() {
        let embeddings = Embeddings::init(Arc::new(FailingProvider)).await;
        assert!(!embeddings.is_available());
        assert_eq!(embeddings.model_name(), None);
        assert!(matches!(
            embeddings.embed("anything").await,
            Err(MemdexError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_dimension_fails_init() {
        let embeddings = Embeddings::init(Arc::new(LocalEmbedding::new(0))).await;
        assert!(!embeddings.is_available());
    }

    #[tokio::test]
    async fn test_disabled_refuses_embed() {
        let embeddings = Embeddings::disabled();
        assert!(!embeddings.is_available());
        assert!(embeddings.embed_batch(&["x"]).await.is_err());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let embeddings = Embeddings::init(Arc::new(WrongDimension)).await;
        assert!(matches!(
            embeddings.embed("x").await,
            Err(MemdexError::Embedding(_))
        ));
    }

    #[test]
    fn test_truncate_for_embedding() {
        assert_eq!(truncate_for_embedding("hello", 10), "hello");
        assert_eq!(truncate_for_embedding("hello", 3), "hel");
        assert_eq!(truncate_for_embedding("héllo", 2), "hé");
        assert_eq!(truncate_for_embedding("", 0), "");
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }
}
