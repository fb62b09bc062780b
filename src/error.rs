//! Error types for knowledge-agent
//!
//! This module provides the error taxonomy shared by ingestion, retrieval,
//! routing and generation. Query-path errors are scoped to a single chat turn;
//! ingestion errors abort the whole document.

use thiserror::Error;

/// Main error type for knowledge-agent operations
#[derive(Error, Debug)]
pub enum AgentError {
    /// Bad chunking, index or runtime configuration (rejected before any work starts)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The embedding model or service could not be reached or timed out
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Missing chunk or document
    #[error("Not found: {0}")]
    NotFound(String),

    /// The vector index references a chunk the document store lacks
    #[error("Index/store drift: chunk {0} is indexed but not stored")]
    IndexStoreDrift(String),

    /// The language model call failed or timed out
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// Database/storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Text extraction errors (PDF, DOCX, ...)
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// A document produced no text to index
    #[error("Document has no extractable text: {0}")]
    EmptyDocument(String),

    /// Calendar or email collaborator failures
    #[error("External service error: {0}")]
    ExternalService(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(String),
}

/// Result type alias for knowledge-agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::EmbeddingUnavailable(_) | AgentError::GenerationFailed(_)
        )
    }

    /// Text suitable for showing to a chat user in place of an answer
    pub fn user_message(&self) -> String {
        match self {
            AgentError::EmbeddingUnavailable(_) => {
                "Retrieval is unavailable right now, please try again in a moment.".to_string()
            }
            AgentError::GenerationFailed(_) => {
                "Sorry, I couldn't generate an answer right now. Please try again.".to_string()
            }
            AgentError::ExternalService(_) => {
                "Sorry, the requested service did not respond. Please try again.".to_string()
            }
            other => format!("Sorry, I encountered an error: {}", other),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Generic(err.to_string())
    }
}

impl From<bincode::Error> for AgentError {
    fn from(err: bincode::Error) -> Self {
        AgentError::Storage(format!("index serialization: {}", err))
    }
}

impl<T> From<std::sync::PoisonError<T>> for AgentError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        AgentError::Storage("knowledge base lock poisoned".to_string())
    }
}
