//! Knowledge base: document store and vector index kept in step
//!
//! Both structures sit behind one mutex. Ingestion embeds outside the lock,
//! then commits the store transaction and updates the index inside a single
//! critical section; deletion removes index entries before the store rows.
//! Readers therefore never see a chunk in one structure but not the other.

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::ml::embedding::{Embedder, Embedding, embed_batch_with_timeout};
use crate::ml::index::VectorIndex;
use crate::storage::{DocumentRecord, DocumentStore};
use crate::text::{Chunk, DocumentFormat, TextChunker, extract_file, extract_text};
use crate::utils::document_fingerprint;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A retrieved chunk with its score and source filename
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedPassage {
    pub chunk: Chunk,
    pub score: f32,
    pub filename: String,
}

/// Knowledge base statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeBaseStats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub index_entries: usize,
    pub index_dimension: usize,
    pub database_size_bytes: u64,
    pub embedding_model: String,
}

/// One of the bundled example documents
#[derive(Debug, Clone, Copy)]
pub struct SampleDocument {
    pub filename: &'static str,
    pub text: &'static str,
}

struct State {
    store: DocumentStore,
    index: VectorIndex,
    /// Indexed ids found missing from the store, removed on the next write
    pending_drift: Vec<String>,
}

/// Ingestion and deletion coordinator
pub struct KnowledgeBase {
    state: Mutex<State>,
    embedder: Arc<dyn Embedder>,
    chunker: TextChunker,
    embed_timeout: Duration,
    index_path: Option<PathBuf>,
}

impl KnowledgeBase {
    /// Open the on-disk knowledge base named by `config.storage`
    pub fn open(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let store = DocumentStore::open(&config.storage.database_path)?;
        let index_path = config.storage.index_path.clone();
        let index = if index_path.exists() {
            VectorIndex::open(&index_path)?
        } else {
            log::info!("No vector index at {:?}, starting empty", index_path);
            VectorIndex::new(embedder.dimension(), config.index.metric)
        };
        Self::from_parts(config, embedder, store, index, Some(index_path))
    }

    /// Knowledge base held entirely in memory
    pub fn in_memory(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let store = DocumentStore::memory()?;
        let index = VectorIndex::new(embedder.dimension(), config.index.metric);
        Self::from_parts(config, embedder, store, index, None)
    }

    fn from_parts(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        store: DocumentStore,
        index: VectorIndex,
        index_path: Option<PathBuf>,
    ) -> Result<Self> {
        if index.dimension() != embedder.dimension() {
            return Err(AgentError::InvalidConfiguration(format!(
                "vector index has dimension {} but embedder {} produces {}; run rebuild-index or re-ingest",
                index.dimension(),
                embedder.model_id(),
                embedder.dimension()
            )));
        }
        if index.metric() != config.index.metric {
            log::warn!(
                "Vector index was built with {:?}, configuration asks for {:?}; keeping the index metric",
                index.metric(),
                config.index.metric
            );
        }

        let kb = Self {
            state: Mutex::new(State {
                store,
                index,
                pending_drift: Vec::new(),
            }),
            embedder,
            chunker: TextChunker::new(config.chunking.clone())?,
            embed_timeout: config.embedding.timeout(),
            index_path,
        };
        kb.reconcile()?;
        Ok(kb)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        Ok(self.state.lock()?)
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn embed_timeout(&self) -> Duration {
        self.embed_timeout
    }

    /// Bring the index in line with the store after load
    fn reconcile(&self) -> Result<()> {
        let mut state = self.lock()?;
        let stored = state.store.all_embeddings()?;
        let stored_ids: HashSet<&str> = stored.iter().map(|(id, _)| id.as_str()).collect();

        let orphans: Vec<String> = state
            .index
            .chunk_ids()
            .filter(|id| !stored_ids.contains(id))
            .map(str::to_string)
            .collect();
        for id in &orphans {
            log::warn!("{}", AgentError::IndexStoreDrift(id.clone()));
            state.index.remove(id);
        }

        let mut restored = 0;
        for (id, vector) in &stored {
            if !state.index.contains(id) {
                state.index.insert(id, vector.clone())?;
                restored += 1;
            }
        }

        if !orphans.is_empty() || restored > 0 {
            log::info!(
                "Reconciled vector index: removed {} orphans, restored {} entries",
                orphans.len(),
                restored
            );
            self.persist_index(&state);
        }
        log::info!(
            "Knowledge base ready: {} chunks indexed",
            state.index.len()
        );
        Ok(())
    }

    fn persist_index(&self, state: &State) {
        if let Some(path) = &self.index_path {
            if let Err(e) = state.index.save(path) {
                // The next open reconciles the file against the store
                log::error!("Failed to persist vector index to {:?}: {}", path, e);
            }
        }
    }

    fn heal_drift(state: &mut State) {
        for id in std::mem::take(&mut state.pending_drift) {
            if state.index.remove(&id).is_some() {
                log::info!("Removed drifted chunk {} from vector index", id);
            }
        }
    }

    /// Chunk, embed and store already-extracted text
    pub async fn ingest_text(
        &self,
        filename: &str,
        format: DocumentFormat,
        text: &str,
    ) -> Result<DocumentRecord> {
        if text.trim().is_empty() {
            return Err(AgentError::EmptyDocument(filename.to_string()));
        }

        let document_id = document_fingerprint(filename, text);
        let chunks = self.chunker.chunk_text(&document_id, text);
        if chunks.is_empty() {
            return Err(AgentError::EmptyDocument(filename.to_string()));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings =
            embed_batch_with_timeout(self.embedder.as_ref(), &texts, self.embed_timeout).await?;
        self.check_embeddings(&chunks, &embeddings)?;

        let mut document = DocumentRecord::new(&document_id, filename, format);
        document.chunk_count = chunks.len();

        let mut state = self.lock()?;
        Self::heal_drift(&mut state);

        let previous: Vec<String> = state
            .store
            .document_chunks(&document_id)?
            .into_iter()
            .map(|c| c.id)
            .collect();

        state.store.ingest(&document, &chunks, &embeddings)?;

        let current: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        for id in previous.iter().filter(|id| !current.contains(id.as_str())) {
            state.index.remove(id);
        }
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            state.index.insert(&chunk.id, embedding)?;
        }
        self.persist_index(&state);

        if previous.is_empty() {
            log::info!("Ingested {} as {} ({} chunks)", filename, document_id, chunks.len());
        } else {
            log::info!("Re-ingested {} as {} ({} chunks)", filename, document_id, chunks.len());
        }
        Ok(document)
    }

    fn check_embeddings(&self, chunks: &[Chunk], embeddings: &[Embedding]) -> Result<()> {
        if embeddings.len() != chunks.len() {
            return Err(AgentError::EmbeddingUnavailable(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        let dimension = self.embedder.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
            return Err(AgentError::InvalidConfiguration(format!(
                "embedding dimension {} doesn't match {}",
                bad.len(),
                dimension
            )));
        }
        Ok(())
    }

    /// Extract raw bytes of the declared format, then ingest
    pub async fn ingest_bytes(
        &self,
        filename: &str,
        bytes: &[u8],
        format: DocumentFormat,
    ) -> Result<DocumentRecord> {
        let text = extract_text(bytes, format)?;
        self.ingest_text(filename, format, &text).await
    }

    /// Read, extract and ingest a file from disk
    pub async fn ingest_file<P: AsRef<Path>>(&self, path: P) -> Result<DocumentRecord> {
        let path = path.as_ref();
        let (format, text) = extract_file(path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
            .to_string();
        self.ingest_text(&filename, format, &text).await
    }

    /// Remove a document, its chunks and their index entries
    pub fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut state = self.lock()?;
        Self::heal_drift(&mut state);

        let chunk_ids: Vec<String> = state
            .store
            .document_chunks(document_id)?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut removed: Vec<(String, Embedding)> = Vec::with_capacity(chunk_ids.len());
        for id in &chunk_ids {
            if let Some(vector) = state.index.remove(id) {
                removed.push((id.clone(), vector));
            }
        }

        if let Err(e) = state.store.delete_document(document_id) {
            for (id, vector) in removed {
                state.index.insert(&id, vector)?;
            }
            return Err(e);
        }

        self.persist_index(&state);
        Ok(chunk_ids.len())
    }

    /// Recreate the vector index from embeddings held in the store
    pub fn rebuild_index(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let metric = state.index.metric();
        let mut index = VectorIndex::new(self.embedder.dimension(), metric);
        for (id, vector) in state.store.all_embeddings()? {
            index.insert(&id, vector)?;
        }
        state.index = index;
        state.pending_drift.clear();
        self.persist_index(&state);
        log::info!("Rebuilt vector index with {} entries", state.index.len());
        Ok(state.index.len())
    }

    /// Search the index with a query vector and join hits against the store
    ///
    /// Hits scoring below `min_score` are dropped. Hits missing from the
    /// store are skipped, logged, and queued for removal on the next write.
    pub fn search_vector(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievedPassage>> {
        let mut state = self.lock()?;
        let hits = state.index.search(query, top_k)?;

        let mut filenames: HashMap<String, String> = HashMap::new();
        let mut passages = Vec::with_capacity(hits.len());
        for hit in hits.into_iter().filter(|h| h.score >= min_score) {
            let chunk = match state.store.get_chunk(&hit.chunk_id) {
                Ok(chunk) => chunk,
                Err(AgentError::NotFound(_)) => {
                    log::warn!("{}", AgentError::IndexStoreDrift(hit.chunk_id.clone()));
                    state.pending_drift.push(hit.chunk_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let filename = match filenames.get(&chunk.document_id) {
                Some(name) => name.clone(),
                None => {
                    let name = state
                        .store
                        .get_document(&chunk.document_id)
                        .map(|d| d.filename)
                        .unwrap_or_else(|_| chunk.document_id.clone());
                    filenames.insert(chunk.document_id.clone(), name.clone());
                    name
                }
            };

            passages.push(RetrievedPassage {
                chunk,
                score: hit.score,
                filename,
            });
        }
        Ok(passages)
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        self.lock()?.store.list_documents()
    }

    pub fn get_document(&self, document_id: &str) -> Result<DocumentRecord> {
        self.lock()?.store.get_document(document_id)
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Result<Chunk> {
        self.lock()?.store.get_chunk(chunk_id)
    }

    /// Number of entries in the vector index
    pub fn index_len(&self) -> Result<usize> {
        Ok(self.lock()?.index.len())
    }

    pub fn stats(&self) -> Result<KnowledgeBaseStats> {
        let state = self.lock()?;
        let store = state.store.stats()?;
        Ok(KnowledgeBaseStats {
            document_count: store.document_count,
            chunk_count: store.chunk_count,
            index_entries: state.index.len(),
            index_dimension: state.index.dimension(),
            database_size_bytes: store.file_size_bytes,
            embedding_model: self.embedder.model_id(),
        })
    }

    /// Ingest the bundled company documents
    pub async fn seed_samples(&self) -> Result<Vec<DocumentRecord>> {
        let mut records = Vec::new();
        for sample in sample_documents() {
            records.push(
                self.ingest_text(sample.filename, DocumentFormat::Txt, sample.text)
                    .await?,
            );
        }
        Ok(records)
    }

    #[cfg(test)]
    pub(crate) fn inject_drift(&self, chunk_id: &str, vector: Embedding) -> Result<()> {
        self.lock()?.index.insert(chunk_id, vector)
    }
}

/// The three example company documents
pub fn sample_documents() -> [SampleDocument; 3] {
    [
        SampleDocument {
            filename: "Employee Handbook - HR Policies.txt",
            text: "Employee Handbook - Remote Work Policy

Our company supports flexible work arrangements to promote work-life balance.

Remote Work Guidelines:
- Employees may work remotely up to 3 days per week
- Core collaboration hours are 10 AM - 3 PM in company timezone
- All remote workers must have reliable internet connection
- Home office setup stipend of $500 available annually

Vacation Policy:
- All full-time employees receive 25 vacation days per year
- Vacation days accrue monthly at 2.08 days per month
- Maximum carryover is 5 days into the following year
- Vacation requests require 2 weeks advance notice for trips over 5 days

Benefits Package:
- Health insurance with 90% company coverage
- Dental and vision insurance included
- 401(k) with 4% company matching
- Professional development budget of $2,000 per year
- Flexible spending account (FSA) available
",
        },
        SampleDocument {
            filename: "Engineering Guidelines.txt",
            text: "Engineering Guidelines - Technology Stack

Backend Technologies:
- Primary language: Python 3.9+
- Web framework: FastAPI for APIs, Django for web applications
- Database: PostgreSQL for production, SQLite for development
- Caching: Redis for session storage and caching
- Message queue: RabbitMQ for async processing

Frontend Technologies:
- Framework: React 18+ with TypeScript
- State management: Redux Toolkit
- Styling: Tailwind CSS
- Build tool: Vite

DevOps and Infrastructure:
- Cloud platform: AWS (EC2, S3, RDS)
- Containerization: Docker with Docker Compose
- CI/CD: GitHub Actions
- Monitoring: DataDog for application monitoring
- Version control: Git with GitHub

Security Requirements:
- All APIs must use JWT authentication
- Database connections must use SSL
- Environment variables for all secrets
- Regular security audits quarterly
",
        },
        SampleDocument {
            filename: "Sales Playbook.txt",
            text: "Sales Team Playbook - Lead Management

Lead Qualification Process:
1. Initial contact within 24 hours of lead submission
2. BANT qualification (Budget, Authority, Need, Timeline)
3. Discovery call to understand use case and requirements
4. Technical demo tailored to prospect's needs
5. Proposal and pricing discussion
6. Contract negotiation and closing

Pricing Structure:
- Starter Plan: $99/month for up to 10 users
- Professional Plan: $299/month for up to 50 users
- Enterprise Plan: Custom pricing for 50+ users
- Annual subscriptions receive 20% discount

Key Performance Metrics:
- Lead response time target: Under 4 hours
- Demo-to-close rate target: 25%
- Average sales cycle: 45 days
- Customer acquisition cost (CAC): $1,200

CRM Usage:
- All prospect interactions must be logged in Salesforce
- Lead scoring system: Hot (>80), Warm (50-80), Cold (<50)
- Weekly pipeline reviews every Tuesday at 2 PM
",
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingStrategy, EmbeddingConfig};
    use crate::ml::embedding::HashingEmbedder;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.chunking.chunk_size = 40;
        config.chunking.overlap = 5;
        config.chunking.strategy = ChunkingStrategy::Word;
        config.embedding = EmbeddingConfig {
            dimension: 256,
            ..Default::default()
        };
        config.storage.database_path = dir.join("kb.db");
        config.storage.index_path = dir.join("kb.idx");
        config
    }

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::new(256))
    }

    #[tokio::test]
    async fn test_ingest_keeps_index_and_store_in_step() {
        let dir = tempdir().unwrap();
        let kb = KnowledgeBase::open(&test_config(dir.path()), embedder()).unwrap();
        let records = kb.seed_samples().await.unwrap();

        let stats = kb.stats().unwrap();
        assert_eq!(stats.document_count, 3);
        assert_eq!(stats.chunk_count, records.iter().map(|r| r.chunk_count).sum::<usize>());
        assert_eq!(stats.index_entries, stats.chunk_count);
    }

    #[tokio::test]
    async fn test_empty_document_is_rejected() {
        let dir = tempdir().unwrap();
        let kb = KnowledgeBase::open(&test_config(dir.path()), embedder()).unwrap();
        let err = kb
            .ingest_text("blank.txt", DocumentFormat::Txt, " \n\t ")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::EmptyDocument(_)));
        assert_eq!(kb.stats().unwrap().chunk_count, 0);
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let dir = tempdir().unwrap();
        let kb = KnowledgeBase::open(&test_config(dir.path()), embedder()).unwrap();
        let text = "Expense reports are due on the fifth business day of each month.";
        let first = kb.ingest_text("expenses.txt", DocumentFormat::Txt, text).await.unwrap();
        let second = kb.ingest_text("expenses.txt", DocumentFormat::Txt, text).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(kb.list_documents().unwrap().len(), 1);
        assert_eq!(kb.index_len().unwrap(), first.chunk_count);
    }

    #[tokio::test]
    async fn test_delete_removes_from_both() {
        let dir = tempdir().unwrap();
        let kb = KnowledgeBase::open(&test_config(dir.path()), embedder()).unwrap();
        let records = kb.seed_samples().await.unwrap();
        let removed = kb.delete_document(&records[0].id).unwrap();

        assert_eq!(removed, records[0].chunk_count);
        let stats = kb.stats().unwrap();
        assert_eq!(stats.document_count, 2);
        assert_eq!(stats.index_entries, stats.chunk_count);
        assert!(matches!(
            kb.delete_document(&records[0].id),
            Err(AgentError::NotFound(_))
        ));
        // the failed delete must not disturb the index
        assert_eq!(kb.stats().unwrap().index_entries, stats.chunk_count);
    }

    #[tokio::test]
    async fn test_reopen_restores_index() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let count = {
            let kb = KnowledgeBase::open(&config, embedder()).unwrap();
            kb.seed_samples().await.unwrap();
            kb.index_len().unwrap()
        };

        let kb = KnowledgeBase::open(&config, embedder()).unwrap();
        assert_eq!(kb.index_len().unwrap(), count);
    }

    #[tokio::test]
    async fn test_missing_index_file_is_rebuilt_from_store() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let count = {
            let kb = KnowledgeBase::open(&config, embedder()).unwrap();
            kb.seed_samples().await.unwrap();
            kb.index_len().unwrap()
        };
        std::fs::remove_file(&config.storage.index_path).unwrap();

        let kb = KnowledgeBase::open(&config, embedder()).unwrap();
        assert_eq!(kb.index_len().unwrap(), count);
        assert!(config.storage.index_path.exists());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_fails_fast() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let kb = KnowledgeBase::open(&config, embedder()).unwrap();
            kb.seed_samples().await.unwrap();
        }
        let other: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(128));
        assert!(matches!(
            KnowledgeBase::open(&config, other),
            Err(AgentError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_drift_is_skipped_then_healed() {
        let dir = tempdir().unwrap();
        let kb = KnowledgeBase::open(&test_config(dir.path()), embedder()).unwrap();
        kb.seed_samples().await.unwrap();

        let ghost = HashingEmbedder::new(256).embed_sync("ghost chunk");
        kb.inject_drift("ghost-00000", ghost.clone()).unwrap();

        let passages = kb.search_vector(&ghost, 3, -1.0).unwrap();
        assert!(passages.iter().all(|p| p.chunk.id != "ghost-00000"));

        let before = kb.index_len().unwrap();
        kb.ingest_text("note.txt", DocumentFormat::Txt, "A short note.")
            .await
            .unwrap();
        assert_eq!(kb.index_len().unwrap(), before);
    }

    #[tokio::test]
    async fn test_rebuild_index() {
        let dir = tempdir().unwrap();
        let kb = KnowledgeBase::open(&test_config(dir.path()), embedder()).unwrap();
        kb.seed_samples().await.unwrap();
        let chunks = kb.stats().unwrap().chunk_count;
        assert_eq!(kb.rebuild_index().unwrap(), chunks);
    }
}
