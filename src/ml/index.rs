//! In-memory vector index with versioned on-disk persistence
//!
//! The index maps chunk ids to embedding vectors and answers exact top-k
//! similarity queries. Results are ordered by descending score; ties keep
//! insertion order. Re-inserting an id replaces its vector in place and keeps
//! its original insertion position.
//!
//! Serialized form: `KAVX` magic, little-endian `u32` format version, `u32`
//! dimension, one metric tag byte, then a bincode payload of the entries in
//! insertion order.

use crate::config::DistanceMetric;
use crate::error::{AgentError, Result};
use crate::ml::embedding::Embedding;
use crate::ml::search::SearchHit;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;

/// File magic for persisted indexes
pub const INDEX_MAGIC: &[u8; 4] = b"KAVX";

/// Current persisted format version
pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    chunk_id: String,
    seq: u64,
    vector: Embedding,
}

/// Index statistics
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub entries: usize,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub estimated_memory_bytes: usize,
}

/// Exact nearest-neighbour index over chunk embeddings
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    metric: DistanceMetric,
    entries: Vec<IndexEntry>,
    positions: HashMap<String, usize>,
    next_seq: u64,
}

impl VectorIndex {
    /// Create an empty index for vectors of `dimension` components
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            entries: Vec::new(),
            positions: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.positions.contains_key(chunk_id)
    }

    /// Vector stored for a chunk
    pub fn get(&self, chunk_id: &str) -> Option<&[f32]> {
        self.positions
            .get(chunk_id)
            .map(|&pos| self.entries[pos].vector.as_slice())
    }

    /// Ids of all indexed chunks, in no particular order
    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.chunk_id.as_str())
    }

    fn check_dimension(&self, len: usize, what: &str) -> Result<()> {
        if len != self.dimension {
            return Err(AgentError::InvalidConfiguration(format!(
                "{} dimension {} doesn't match index dimension {}",
                what, len, self.dimension
            )));
        }
        Ok(())
    }

    /// Insert or replace the vector for a chunk
    pub fn insert(&mut self, chunk_id: &str, vector: Embedding) -> Result<()> {
        self.check_dimension(vector.len(), "Vector")?;

        if let Some(&pos) = self.positions.get(chunk_id) {
            self.entries[pos].vector = vector;
            log::debug!("Replaced vector for chunk {}", chunk_id);
            return Ok(());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.positions.insert(chunk_id.to_string(), self.entries.len());
        self.entries.push(IndexEntry {
            chunk_id: chunk_id.to_string(),
            seq,
            vector,
        });
        Ok(())
    }

    /// Remove a chunk, returning its vector if it was present
    pub fn remove(&mut self, chunk_id: &str) -> Option<Embedding> {
        let pos = self.positions.remove(chunk_id)?;
        let removed = self.entries.swap_remove(pos);
        if let Some(moved) = self.entries.get(pos) {
            self.positions.insert(moved.chunk_id.clone(), pos);
        }
        Some(removed.vector)
    }

    /// Top-`k` chunks by similarity to `query`, best first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.check_dimension(query.len(), "Query")?;
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, u64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (self.metric.similarity(query, &e.vector), e.seq, pos))
            .collect();

        let by_rank = |a: &(f32, u64, usize), b: &(f32, u64, usize)| -> Ordering {
            b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
        };

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_rank);
            scored.truncate(k);
        }
        scored.sort_by(by_rank);

        Ok(scored
            .into_iter()
            .map(|(score, _, pos)| SearchHit {
                chunk_id: self.entries[pos].chunk_id.clone(),
                score,
            })
            .collect())
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
        self.next_seq = 0;
    }

    pub fn stats(&self) -> IndexStats {
        let vector_bytes = self.entries.len() * self.dimension * std::mem::size_of::<f32>();
        let id_bytes: usize = self.entries.iter().map(|e| e.chunk_id.len() * 2).sum();
        IndexStats {
            entries: self.entries.len(),
            dimension: self.dimension,
            metric: self.metric,
            estimated_memory_bytes: vector_bytes + id_bytes,
        }
    }

    /// Serialize to the versioned binary form
    pub fn persist(&self) -> Result<Vec<u8>> {
        let mut ordered: Vec<&IndexEntry> = self.entries.iter().collect();
        ordered.sort_by_key(|e| e.seq);

        let mut buf = Vec::with_capacity(16 + self.stats().estimated_memory_bytes);
        buf.extend_from_slice(INDEX_MAGIC);
        buf.write_u32::<LittleEndian>(INDEX_FORMAT_VERSION)?;
        buf.write_u32::<LittleEndian>(self.dimension as u32)?;
        buf.write_u8(self.metric.tag())?;
        bincode::serialize_into(&mut buf, &ordered)?;
        Ok(buf)
    }

    /// Restore an index from [`persist`](Self::persist) output
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);

        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic).map_err(|_| {
            AgentError::InvalidConfiguration("vector index file is truncated".to_string())
        })?;
        if &magic != INDEX_MAGIC {
            return Err(AgentError::InvalidConfiguration(
                "not a knowledge-agent vector index (bad magic)".to_string(),
            ));
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        if version != INDEX_FORMAT_VERSION {
            return Err(AgentError::InvalidConfiguration(format!(
                "vector index format version {} is not supported (expected {})",
                version, INDEX_FORMAT_VERSION
            )));
        }

        let dimension = cursor.read_u32::<LittleEndian>()? as usize;
        let tag = cursor.read_u8()?;
        let metric = DistanceMetric::from_tag(tag).ok_or_else(|| {
            AgentError::InvalidConfiguration(format!("unknown metric tag {} in vector index", tag))
        })?;

        let entries: Vec<IndexEntry> = bincode::deserialize_from(&mut cursor)?;

        let mut index = Self::new(dimension, metric);
        for entry in entries {
            index.check_dimension(entry.vector.len(), "Stored vector")?;
            if index.positions.contains_key(&entry.chunk_id) {
                return Err(AgentError::Storage(format!(
                    "duplicate chunk {} in vector index",
                    entry.chunk_id
                )));
            }
            index.next_seq = index.next_seq.max(entry.seq + 1);
            index.positions.insert(entry.chunk_id.clone(), index.entries.len());
            index.entries.push(entry);
        }
        Ok(index)
    }

    /// Write the index to disk, replacing any previous file atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        crate::utils::ensure_parent_directory(path)?;
        let tmp = path.with_extension("idx.tmp");
        std::fs::write(&tmp, self.persist()?)?;
        std::fs::rename(&tmp, path)?;
        log::info!("Saved vector index to {:?} ({} entries)", path, self.len());
        Ok(())
    }

    /// Read an index written by [`save`](Self::save)
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let index = Self::load(&bytes)?;
        log::info!(
            "Loaded vector index from {:?} with {} entries",
            path.as_ref(),
            index.len()
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn index_with(vectors: &[(&str, [f32; 3])]) -> VectorIndex {
        let mut index = VectorIndex::new(3, DistanceMetric::Cosine);
        for (id, v) in vectors {
            index.insert(id, v.to_vec()).unwrap();
        }
        index
    }

    #[test]
    fn test_search_orders_by_score() {
        let index = index_with(&[
            ("a", [1.0, 0.0, 0.0]),
            ("b", [0.7, 0.7, 0.0]),
            ("c", [0.0, 1.0, 0.0]),
        ]);

        let hits = index.search(&[1.0, 0.1, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "a");
        assert_eq!(hits[1].chunk_id, "b");
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let index = index_with(&[
            ("first", [0.0, 1.0, 0.0]),
            ("second", [0.0, 1.0, 0.0]),
            ("third", [0.0, 1.0, 0.0]),
        ]);
        let ids: Vec<String> = index
            .search(&[0.0, 2.0, 0.0], 3)
            .unwrap()
            .into_iter()
            .map(|h| h.chunk_id)
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);

        let top_two: Vec<String> = index
            .search(&[0.0, 2.0, 0.0], 2)
            .unwrap()
            .into_iter()
            .map(|h| h.chunk_id)
            .collect();
        assert_eq!(top_two, vec!["first", "second"]);
    }

    #[test]
    fn test_empty_index_and_large_k() {
        let empty = VectorIndex::new(3, DistanceMetric::Cosine);
        assert!(empty.search(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());

        let index = index_with(&[("a", [1.0, 0.0, 0.0]), ("b", [0.0, 1.0, 0.0])]);
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 50).unwrap().len(), 2);
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let mut index = index_with(&[("a", [1.0, 0.0, 0.0]), ("b", [0.0, 1.0, 0.0])]);
        index.insert("a", vec![0.0, 0.0, 1.0]).unwrap();

        assert_eq!(index.len(), 2);
        let hits = index.search(&[0.0, 0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].chunk_id, "a");
        assert_relative_eq!(hits[0].score, 1.0);
    }

    #[test]
    fn test_remove_is_never_returned() {
        let mut index = index_with(&[
            ("a", [1.0, 0.0, 0.0]),
            ("b", [0.9, 0.1, 0.0]),
            ("c", [0.0, 1.0, 0.0]),
        ]);
        assert!(index.remove("a").is_some());
        assert!(index.remove("a").is_none());
        assert!(!index.contains("a"));

        let hits = index.search(&[1.0, 0.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.chunk_id != "a"));
        // swap_remove moved "c"; its position must still resolve
        assert_eq!(index.get("c"), Some([0.0, 1.0, 0.0].as_slice()));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new(3, DistanceMetric::Cosine);
        assert!(matches!(
            index.insert("a", vec![1.0, 2.0]),
            Err(AgentError::InvalidConfiguration(_))
        ));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_persist_round_trip() {
        let mut index = index_with(&[
            ("a", [1.0, 0.0, 0.0]),
            ("b", [0.5, 0.5, 0.0]),
            ("c", [0.0, 1.0, 0.0]),
            ("d", [0.0, 0.5, 0.5]),
        ]);
        index.remove("b");
        index.insert("e", vec![0.5, 0.5, 0.0]).unwrap();

        let restored = VectorIndex::load(&index.persist().unwrap()).unwrap();
        assert_eq!(restored.len(), index.len());
        assert_eq!(restored.metric(), DistanceMetric::Cosine);

        for query in [[1.0, 0.0, 0.0], [0.0, 1.0, 1.0], [0.3, 0.3, 0.3]] {
            let before = index.search(&query, 4).unwrap();
            let after = restored.search(&query, 4).unwrap();
            assert_eq!(before.len(), after.len());
            for (x, y) in before.iter().zip(after.iter()) {
                assert_eq!(x.chunk_id, y.chunk_id);
                assert_relative_eq!(x.score, y.score, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_version_mismatch_fails_fast() {
        let index = index_with(&[("a", [1.0, 0.0, 0.0])]);
        let mut bytes = index.persist().unwrap();
        bytes[4] = 99;
        assert!(matches!(
            VectorIndex::load(&bytes),
            Err(AgentError::InvalidConfiguration(_))
        ));

        let mut bad_magic = index.persist().unwrap();
        bad_magic[0] = b'X';
        assert!(matches!(
            VectorIndex::load(&bad_magic),
            Err(AgentError::InvalidConfiguration(_))
        ));
        assert!(VectorIndex::load(b"KA").is_err());
    }

    #[test]
    fn test_save_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kb").join("knowledge.idx");
        let index = index_with(&[("a", [1.0, 0.0, 0.0]), ("b", [0.0, 1.0, 0.0])]);
        index.save(&path).unwrap();

        let opened = VectorIndex::open(&path).unwrap();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened.dimension(), 3);
        let mut restored = opened;
        restored.insert("c", vec![0.0, 0.0, 1.0]).unwrap();
        // new ids sort after restored ones on ties
        let hits = restored.search(&[1.0, 1.0, 1.0], 3).unwrap();
        assert_eq!(hits[2].chunk_id, "c");
    }
}
