//! Configuration for knowledge-agent
//!
//! Defaults are suitable for a local setup: an Ollama server on the default
//! port, a SQLite knowledge base in the working directory, and the offline
//! hashing embedder. A JSON file can override any section and a handful of
//! `KNOWLEDGE_AGENT_*` environment variables override the file.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub conversation: ConversationConfig,
    pub intent: IntentConfig,
    pub llm: LlmConfig,
    pub generation: GenerationConfig,
    pub storage: StorageConfig,
}

/// How the chunker measures its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Windows of whitespace-delimited words
    Word,
    /// Windows of Unicode scalar values
    Character,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Window size, in units of `strategy`
    pub chunk_size: usize,
    /// Units shared by consecutive chunks
    pub overlap: usize,
    pub strategy: ChunkingStrategy,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 100,
            strategy: ChunkingStrategy::Character,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(AgentError::InvalidConfiguration(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(AgentError::InvalidConfiguration(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Which embedding backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Deterministic feature-hashing embedder, no network
    Hashing,
    /// Ollama `/api/embeddings`
    Ollama,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    /// Model name, pinned for the lifetime of an index
    pub model: String,
    pub dimension: usize,
    /// Base URL of the embedding server (Ollama provider only)
    pub base_url: String,
    pub timeout_secs: u64,
    /// Capacity of the query embedding LRU cache (0 disables it)
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: "all-minilm".to_string(),
            dimension: 384,
            base_url: "http://localhost:11434".to_string(),
            timeout_secs: 30,
            cache_capacity: 256,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Similarity metric used by the vector index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Cosine similarity in [-1, 1]
    Cosine,
    /// Raw inner product
    DotProduct,
    /// L2, reported as `1 / (1 + distance)`
    Euclidean,
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub metric: DistanceMetric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Cosine,
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Relevance floor; hits scoring below it are dropped
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            min_score: 0.2,
        }
    }
}

/// When a question is treated as a follow-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpPolicy {
    /// Short or referential phrasing triggers augmentation
    Heuristic,
    Always,
    Never,
}

/// Conversation memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub max_exchanges: usize,
    pub follow_up: FollowUpPolicy,
    /// Questions with at most this many words count as short
    pub follow_up_max_words: usize,
    /// Turns folded into an augmented query (clamped to 1..=2)
    pub summary_turns: usize,
    /// Per-field character cap inside the folded summary
    pub summary_chars: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_exchanges: 5,
            follow_up: FollowUpPolicy::Heuristic,
            follow_up_max_words: 6,
            summary_turns: 2,
            summary_chars: 200,
        }
    }
}

/// Intent routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Ask the language model when keyword rules are inconclusive
    pub model_fallback: bool,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            model_fallback: true,
        }
    }
}

/// Language model configuration (OpenAI-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Empty for local servers such as Ollama
    pub api_key: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.2".to_string(),
            api_key: String::new(),
            timeout_secs: 60,
            max_tokens: 500,
            temperature: 0.7,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What to answer when no passage clears the relevance floor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoContextPolicy {
    /// Fixed reply, the model is not called
    Decline,
    /// The model answers from general knowledge, prefixed with a caveat
    GeneralKnowledge,
}

/// Prompt assembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Characters of passage text allowed into one prompt
    pub context_char_budget: usize,
    /// Recent turns quoted in the prompt
    pub history_turns: usize,
    pub no_context: NoContextPolicy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            context_char_budget: 4000,
            history_turns: 3,
            no_context: NoContextPolicy::Decline,
        }
    }
}

/// On-disk locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub index_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("knowledge.db"),
            index_path: PathBuf::from("knowledge.idx"),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file; missing sections keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&data)?;
        log::info!("Loaded configuration from {:?}", path.as_ref());
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Apply `KNOWLEDGE_AGENT_*` environment overrides
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("KNOWLEDGE_AGENT_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("KNOWLEDGE_AGENT_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("KNOWLEDGE_AGENT_LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Ok(v) = std::env::var("KNOWLEDGE_AGENT_DB_PATH") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KNOWLEDGE_AGENT_INDEX_PATH") {
            self.storage.index_path = PathBuf::from(v);
        }
        self
    }

    /// Reject configurations that would fail later in the pipeline
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;

        if self.embedding.dimension == 0 {
            return Err(AgentError::InvalidConfiguration(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        if self.embedding.timeout_secs == 0 || self.llm.timeout_secs == 0 {
            return Err(AgentError::InvalidConfiguration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(AgentError::InvalidConfiguration(
                "top_k must be greater than zero".to_string(),
            ));
        }
        if self.conversation.max_exchanges == 0 {
            return Err(AgentError::InvalidConfiguration(
                "max_exchanges must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
