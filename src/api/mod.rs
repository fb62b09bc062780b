//! API layer
//!
//! The knowledge base (ingestion, deletion, consistency between store and
//! index), the retriever, and the chat front end.

pub mod chat;
pub mod knowledge_base;
pub mod retriever;

pub use chat::{ChatCommand, ask, chat_loop, quick_ask, render_response, run_chat};
pub use knowledge_base::{
    KnowledgeBase, KnowledgeBaseStats, RetrievedPassage, SampleDocument, sample_documents,
};
pub use retriever::Retriever;
