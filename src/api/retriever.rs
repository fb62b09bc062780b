//! Retriever - query to ranked passages
//!
//! Embeds the query, searches the vector index, drops hits under the
//! relevance floor and joins the survivors against the document store.

use crate::api::knowledge_base::{KnowledgeBase, RetrievedPassage};
use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::ml::embedding::embed_with_timeout;
use std::sync::Arc;

/// Semantic search over a knowledge base
#[derive(Clone)]
pub struct Retriever {
    knowledge_base: Arc<KnowledgeBase>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(knowledge_base: Arc<KnowledgeBase>, config: RetrievalConfig) -> Self {
        Self {
            knowledge_base,
            config,
        }
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge_base
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve with the configured `top_k` and `min_score`
    pub async fn search(&self, query: &str) -> Result<Vec<RetrievedPassage>> {
        self.retrieve(query, self.config.top_k, self.config.min_score)
            .await
    }

    /// Passages scoring at least `min_score`, best first, at most `top_k`
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievedPassage>> {
        let kb = &self.knowledge_base;
        let vector = embed_with_timeout(kb.embedder().as_ref(), query, kb.embed_timeout()).await?;
        let passages = kb.search_vector(&vector, top_k, min_score)?;

        log::debug!(
            "Retrieved {} passages for '{}' (top {}, floor {:.2})",
            passages.len(),
            query,
            top_k,
            min_score
        );
        Ok(passages)
    }
}
