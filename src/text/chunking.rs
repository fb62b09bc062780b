//! Text chunking algorithms and utilities
//!
//! Splits extracted document text into overlapping fixed-size passages.
//! Chunks are spans of the source text: offsets and lengths are counted in
//! characters (Unicode scalar values) and the text of every chunk is an exact
//! slice of the input, so identical input and configuration always produce
//! identical boundaries.

use crate::config::{ChunkingConfig, ChunkingStrategy};
use crate::error::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A contiguous span of a source document's text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    /// Stable identifier, derived from the document id and position
    pub id: String,

    /// Owning document
    pub document_id: String,

    /// Position of the chunk within its document
    pub seq: usize,

    /// The actual text content
    pub text: String,

    /// Character offset in the source text
    pub offset: usize,

    /// Length of the chunk in characters, whatever the chunking strategy
    pub length: usize,
}

/// Build the stable id of the `seq`-th chunk of a document
pub fn chunk_id(document_id: &str, seq: usize) -> String {
    format!("{}-{:05}", document_id, seq)
}

fn word_regex() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"\S+").expect("static regex"))
}

/// Character-window chunking with the given size and overlap
pub fn chunk(document_id: &str, text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    let chunker = TextChunker::new(ChunkingConfig {
        chunk_size,
        overlap,
        strategy: ChunkingStrategy::Character,
    })?;
    Ok(chunker.chunk_text(document_id, text))
}

/// Text chunker for processing documents into manageable chunks
#[derive(Debug, Clone)]
pub struct TextChunker {
    config: ChunkingConfig,
}

impl TextChunker {
    /// Create a new text chunker, rejecting invalid size/overlap combinations
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create a chunker with default configuration
    pub fn with_default_config() -> Result<Self> {
        Self::new(ChunkingConfig::default())
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk text into overlapping segments. Empty input yields no chunks.
    pub fn chunk_text(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let spans = match self.config.strategy {
            ChunkingStrategy::Character => self.character_spans(text),
            ChunkingStrategy::Word => self.word_spans(text),
        };

        let mut chunks = Vec::with_capacity(spans.len());
        let mut char_cursor = 0usize;
        let mut byte_cursor = 0usize;

        for (seq, (start, end)) in spans.into_iter().enumerate() {
            // Starts are non-decreasing, so offsets can be counted incrementally
            char_cursor += text[byte_cursor..start].chars().count();
            byte_cursor = start;

            let slice = &text[start..end];
            chunks.push(Chunk {
                id: chunk_id(document_id, seq),
                document_id: document_id.to_string(),
                seq,
                text: slice.to_string(),
                offset: char_cursor,
                length: slice.chars().count(),
            });
        }

        log::debug!(
            "Chunked {} chars into {} chunks ({:?}, size {}, overlap {})",
            text.chars().count(),
            chunks.len(),
            self.config.strategy,
            self.config.chunk_size,
            self.config.overlap
        );
        chunks
    }

    /// Byte ranges of character windows
    fn character_spans(&self, text: &str) -> Vec<(usize, usize)> {
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let total = boundaries.len() - 1;
        if total == 0 {
            return Vec::new();
        }

        let step = self.config.chunk_size - self.config.overlap;
        let mut spans = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.config.chunk_size).min(total);
            spans.push((boundaries[start], boundaries[end]));
            if end == total {
                break;
            }
            start += step;
        }
        spans
    }

    /// Byte ranges covering windows of whole words
    ///
    /// Each window runs up to the first word of the next one, and the first
    /// and last windows reach the ends of the text, so no whitespace is lost.
    fn word_spans(&self, text: &str) -> Vec<(usize, usize)> {
        let words: Vec<(usize, usize)> = word_regex()
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .collect();
        if words.is_empty() {
            return Vec::new();
        }

        let step = self.config.chunk_size - self.config.overlap;
        let mut spans = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.config.chunk_size).min(words.len());
            let from = if start == 0 { 0 } else { words[start].0 };
            let to = if end == words.len() { text.len() } else { words[end].0 };
            spans.push((from, to));
            if end == words.len() {
                break;
            }
            start += step;
        }
        spans
    }
}

/// Rebuild the source text by dropping each chunk's overlap with its
/// predecessor. Works for both strategies.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered = 0usize;
    for chunk in chunks {
        let skip = covered.saturating_sub(chunk.offset);
        out.extend(chunk.text.chars().skip(skip));
        covered = chunk.offset + chunk.length;
    }
    out
}
