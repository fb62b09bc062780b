//! Machine learning module for knowledge-agent
//!
//! Embedding generation, similarity scoring and the vector index.

pub mod embedding;
pub mod index;
pub mod search;

// Re-export main types and functions
pub use embedding::{
    CachedEmbedder, Embedder, Embedding, HashingEmbedder, OllamaEmbedder, build_embedder,
    embed_batch_with_timeout, embed_with_timeout,
};
pub use index::{INDEX_FORMAT_VERSION, IndexStats, VectorIndex};
pub use search::{SearchHit, cosine_similarity, dot_product, euclidean_distance, normalize};
