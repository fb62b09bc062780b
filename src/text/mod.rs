//! Text processing for knowledge-agent
//!
//! This module turns uploaded documents into plain text and splits that text
//! into overlapping chunks for indexing.

pub mod chunking;
pub mod extract;

// Re-export main types and functions
pub use chunking::{Chunk, TextChunker, chunk, chunk_id, reassemble};
pub use extract::{DocumentFormat, extract_file, extract_text};
