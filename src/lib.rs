//! # knowledge-agent
//!
//! A document question-answering agent. Office documents are chunked,
//! embedded and indexed locally; questions are answered by a language model
//! grounded in the best-matching passages. Each turn is routed by intent
//! (knowledge query, calendar lookup, email draft, small talk), and follow-up
//! questions are read against a short conversation memory.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use knowledge_agent::{Config, ConversationSession, KnowledgeAgent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let agent = KnowledgeAgent::from_config(&config)?;
//!
//!     // Add a document to the knowledge base
//!     agent.knowledge_base().ingest_file("handbook.pdf").await?;
//!
//!     // Ask questions; the session carries follow-up context
//!     let mut session = ConversationSession::new(config.conversation.clone());
//!     let response = agent.handle_turn(&mut session, "What's our vacation policy?").await?;
//!     println!("{}", response.answer);
//!
//!     let response = agent.handle_turn(&mut session, "Does that apply to contractors?").await?;
//!     println!("{}", response.answer);
//!
//!     Ok(())
//! }
//! ```

// Core modules
pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod ml;
pub mod storage;
pub mod text;
pub mod utils;

// Re-export main API types
pub use agent::{
    AgentResponse, ConversationSession, ConversationTurn, Intent, IntentClassification,
    IntentRouter, KnowledgeAgent, LanguageModel,
};
pub use api::{KnowledgeBase, RetrievedPassage, Retriever};
pub use config::Config;
pub use error::{AgentError, Result};

// Re-export commonly used types
pub use ml::{Embedder, VectorIndex};
pub use storage::{DocumentRecord, DocumentStore};
pub use text::{Chunk, DocumentFormat};
