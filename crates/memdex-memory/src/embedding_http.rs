//! OpenAI-compatible embeddings over HTTP (`/v1/embeddings`).
//!
//! Works against OpenAI itself and local servers exposing the same API
//! (Ollama, llama.cpp server, LM Studio).

use async_trait::async_trait;
use memdex_core::{MemdexError, MemdexResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedding::EmbeddingProvider;

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct HttpEmbedding {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
}

impl HttpEmbedding {
    /// Client for `base_url`, which may or may not end in `/embeddings`.
    pub fn new(base_url: &str, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: embeddings_endpoint(base_url),
            api_key: None,
            model: model.into(),
            dimension,
        }
    }

    /// Send `api_key` as a bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Full URL requests are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedding {
    /// Call the endpoint once so an unreachable server degrades the service
    /// at startup instead of failing every index call.
    async fn init(&self) -> MemdexResult<()> {
        let check = self.embed_batch(&["ping"]).await?;
        match check.first() {
            Some(v) if v.len() == self.dimension => Ok(()),
            Some(v) => Err(MemdexError::Embedding(format!(
                "{} returned dimension {}, configured {}",
                self.model,
                v.len(),
                self.dimension
            ))),
            None => Err(MemdexError::Embedding("empty response to init request".to_string())),
        }
    }

    async fn embed(&self, text: &str) -> MemdexResult<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .pop()
            .ok_or_else(|| MemdexError::Embedding("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> MemdexResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MemdexError::Embedding(format!("embedding request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(MemdexError::Embedding(format!(
                "embedding endpoint returned {status}: {text}"
            )));
        }
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| MemdexError::Embedding(format!("invalid embedding response: {e}")))?;

        parsed.data.sort_by_key(|d| d.index);
        debug!(count = parsed.data.len(), model = %self.model, "embedded batch");
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

/// Resolve the embeddings URL from a base URL with or without `/v1`.
fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = base_url.trim_end_matches('/');
    if normalized.ends_with("/embeddings") {
        normalized.to_string()
    } else if has_version_suffix(normalized) {
        format!("{normalized}/embeddings")
    } else {
        format!("{normalized}/v1/embeddings")
    }
}
