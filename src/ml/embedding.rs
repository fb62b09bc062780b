//! Embedding generation
//!
//! The [`Embedder`] capability maps text to fixed-dimension vectors. Two
//! backends are provided: a deterministic feature-hashing embedder that needs
//! no network or model files, and a client for an Ollama server's
//! `/api/embeddings` endpoint. Query embeddings can be memoized with
//! [`CachedEmbedder`].

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::{AgentError, Result};
use crate::ml::search::normalize;
use async_trait::async_trait;
use lru::LruCache;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Embedding vector type
pub type Embedding = Vec<f32>;

/// Text to vector capability shared by ingestion and retrieval
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed many texts, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Output dimension, fixed for the lifetime of an index
    fn dimension(&self) -> usize;

    /// Identifier of the underlying model
    fn model_id(&self) -> String;
}

/// Embed one text, mapping expiry of `timeout` to `EmbeddingUnavailable`
pub async fn embed_with_timeout(
    embedder: &dyn Embedder,
    text: &str,
    timeout: Duration,
) -> Result<Embedding> {
    match tokio::time::timeout(timeout, embedder.embed(text)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::EmbeddingUnavailable(format!(
            "{} did not answer within {:?}",
            embedder.model_id(),
            timeout
        ))),
    }
}

/// Batch variant of [`embed_with_timeout`]
pub async fn embed_batch_with_timeout(
    embedder: &dyn Embedder,
    texts: &[String],
    timeout: Duration,
) -> Result<Vec<Embedding>> {
    match tokio::time::timeout(timeout, embedder.embed_batch(texts)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::EmbeddingUnavailable(format!(
            "{} did not embed {} texts within {:?}",
            embedder.model_id(),
            texts.len(),
            timeout
        ))),
    }
}

/// Build the embedder selected by configuration, wrapped in a query cache
/// when `cache_capacity` is non-zero
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    if config.dimension == 0 {
        return Err(AgentError::InvalidConfiguration(
            "embedding dimension must be greater than zero".to_string(),
        ));
    }

    let inner: Arc<dyn Embedder> = match config.provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(config.dimension)),
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::new(config)?),
    };
    log::info!(
        "Using embedder {} (dimension {})",
        inner.model_id(),
        inner.dimension()
    );

    Ok(match NonZeroUsize::new(config.cache_capacity) {
        Some(capacity) => Arc::new(CachedEmbedder::new(inner, capacity)),
        None => inner,
    })
}

const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from",
    "how", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or", "our", "so", "that", "the",
    "this", "to", "us", "was", "we", "what", "when", "where", "which", "who", "why", "will",
    "with", "you", "your",
];

/// Deterministic feature-hashing embedder
///
/// Content words are lowercased, stripped of a plural `s`, weighted by
/// `1 + ln(tf)` and hashed (FNV-1a) into a signed bucket. The vector is
/// L2-normalized, so cosine similarity reflects shared vocabulary.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn fnv1a(bytes: &[u8]) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }

    fn terms(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .filter(|w| !STOPWORDS.contains(&w.as_str()))
            .map(|w| {
                if w.len() > 3 && w.ends_with('s') && !w.ends_with("ss") {
                    w[..w.len() - 1].to_string()
                } else {
                    w
                }
            })
            .collect()
    }

    /// Synchronous embedding, usable from rayon workers
    pub fn embed_sync(&self, text: &str) -> Embedding {
        let mut counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        for term in Self::terms(text) {
            *counts.entry(term).or_insert(0) += 1;
        }

        let mut embedding = vec![0.0f32; self.dimension];
        for (term, tf) in counts {
            let hash = Self::fnv1a(term.as_bytes());
            let idx = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            embedding[idx] += sign * (1.0 + (tf as f32).ln());
        }
        normalize(&mut embedding);
        embedding
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.par_iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> String {
        format!("hashing-{}", self.dimension)
    }
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Client for an Ollama server's embedding endpoint
pub struct OllamaEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AgentError::InvalidConfiguration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&OllamaEmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| AgentError::EmbeddingUnavailable(format!("{}: {}", self.endpoint, e)))?;

        if !response.status().is_success() {
            return Err(AgentError::EmbeddingUnavailable(format!(
                "{} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let body: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AgentError::EmbeddingUnavailable(format!("bad embedding response: {}", e)))?;

        if body.embedding.len() != self.dimension {
            return Err(AgentError::InvalidConfiguration(format!(
                "model {} returned {} dimensions, configured for {}",
                self.model,
                body.embedding.len(),
                self.dimension
            )));
        }
        let mut embedding = body.embedding;
        normalize(&mut embedding);
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> String {
        format!("ollama:{}", self.model)
    }
}

/// LRU memoization of single-text embeddings
///
/// Batch calls go straight to the inner embedder; ingestion text rarely
/// repeats, query text often does.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, Embedding>>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        if let Some(hit) = self.cache.lock()?.get(text) {
            log::debug!("Embedding cache hit");
            return Ok(hit.clone());
        }
        let embedding = self.inner.embed(text).await?;
        self.cache.lock()?.put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.inner.embed_batch(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}
