//! SQLite document store for knowledge-agent
//!
//! Documents and their chunks live in embedded SQLite. Chunk embeddings are
//! stored next to the chunk text so the vector index can always be rebuilt
//! from the store alone. A document row whose `chunk_count` is zero has not
//! finished ingesting and is invisible to listings; such rows are purged on
//! open.

use crate::error::{AgentError, Result};
use crate::ml::embedding::Embedding;
use crate::storage::migrations::MigrationManager;
use crate::storage::schema::SCHEMA_VERSION;
use crate::text::{Chunk, DocumentFormat};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata for one uploaded source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    pub format: DocumentFormat,
    pub upload_timestamp: DateTime<Utc>,
    pub chunk_count: usize,
}

impl DocumentRecord {
    /// New record stamped with the current time
    pub fn new(id: impl Into<String>, filename: impl Into<String>, format: DocumentFormat) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            format,
            upload_timestamp: Utc::now(),
            chunk_count: 0,
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub file_size_bytes: u64,
}

/// Durable document and chunk storage
pub struct DocumentStore {
    conn: Connection,
    path: Option<PathBuf>,
}

const CHUNK_COLUMNS: &str = r#"id, document_id, seq, text, "offset", length"#;

impl DocumentStore {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        crate::utils::ensure_parent_directory(path.as_ref())?;
        let conn = Connection::open(path.as_ref())
            .map_err(|e| AgentError::Storage(format!("Failed to open database: {}", e)))?;

        let mut store = Self {
            conn,
            path: Some(path.as_ref().to_path_buf()),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            AgentError::Storage(format!("Failed to create in-memory database: {}", e))
        })?;

        let mut store = Self { conn, path: None };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&mut self) -> Result<()> {
        let _: String = self
            .conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| AgentError::Storage(format!("Failed to enable WAL mode: {}", e)))?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        MigrationManager::new(&self.conn).run_migrations()?;

        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;

        let purged = self.purge_incomplete()?;
        if purged > 0 {
            log::warn!("Removed {} partially ingested documents", purged);
        }

        log::info!("Document store initialized with schema version {}", SCHEMA_VERSION);
        Ok(())
    }

    /// Backing file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Register a document; it stays invisible until its chunks are stored
    pub fn put_document(&mut self, document: &DocumentRecord) -> Result<String> {
        self.conn.execute(
            "INSERT INTO documents (id, filename, format, upload_timestamp, chunk_count)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                document.id,
                document.filename,
                document.format.as_str(),
                document.upload_timestamp.to_rfc3339(),
            ],
        )?;
        Ok(document.id.clone())
    }

    /// Store every chunk of a registered document in one transaction
    pub fn put_chunks(
        &mut self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM documents WHERE id = ?1", params![document_id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(AgentError::NotFound(format!("document {}", document_id)));
        }
        Self::insert_chunks(&tx, document_id, chunks, embeddings)?;
        tx.commit()?;
        Ok(())
    }

    /// Replace any previous copy of `document` and store it with its chunks,
    /// all in one transaction
    pub fn ingest(
        &mut self,
        document: &DocumentRecord,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM documents WHERE id = ?1", params![document.id])?;
        tx.execute(
            "INSERT INTO documents (id, filename, format, upload_timestamp, chunk_count)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                document.id,
                document.filename,
                document.format.as_str(),
                document.upload_timestamp.to_rfc3339(),
            ],
        )?;
        Self::insert_chunks(&tx, &document.id, chunks, embeddings)?;
        tx.commit()?;

        log::info!(
            "Stored document {} ({}) with {} chunks",
            document.id,
            document.filename,
            chunks.len()
        );
        Ok(())
    }

    fn insert_chunks(
        tx: &Transaction<'_>,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(AgentError::Storage(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }

        {
            let mut stmt = tx.prepare(
                r#"INSERT INTO chunks (id, document_id, seq, text, "offset", length, embedding)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            )?;
            for (chunk, embedding) in chunks.iter().zip(embeddings) {
                if chunk.document_id != document_id {
                    return Err(AgentError::Storage(format!(
                        "chunk {} belongs to {}, not {}",
                        chunk.id, chunk.document_id, document_id
                    )));
                }
                stmt.execute(params![
                    chunk.id,
                    document_id,
                    chunk.seq as i64,
                    chunk.text,
                    chunk.offset as i64,
                    chunk.length as i64,
                    embedding_to_blob(embedding),
                ])
                .map_err(|e| {
                    AgentError::Storage(format!("Failed to insert chunk {}: {}", chunk.id, e))
                })?;
            }
        }

        tx.execute(
            "UPDATE documents SET chunk_count = chunk_count + ?1 WHERE id = ?2",
            params![chunks.len() as i64, document_id],
        )?;
        Ok(())
    }

    /// Get chunk by id
    pub fn get_chunk(&self, chunk_id: &str) -> Result<Chunk> {
        let sql = format!("SELECT {} FROM chunks WHERE id = ?1", CHUNK_COLUMNS);
        self.conn
            .query_row(&sql, params![chunk_id], row_to_chunk)
            .optional()?
            .ok_or_else(|| AgentError::NotFound(format!("chunk {}", chunk_id)))
    }

    /// Chunks of one document in order
    pub fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE document_id = ?1 ORDER BY seq",
            CHUNK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![document_id], row_to_chunk)?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    /// Get a fully ingested document
    pub fn get_document(&self, document_id: &str) -> Result<DocumentRecord> {
        self.conn
            .query_row(
                "SELECT id, filename, format, upload_timestamp, chunk_count
                 FROM documents WHERE id = ?1 AND chunk_count > 0",
                params![document_id],
                row_to_document,
            )
            .optional()?
            .ok_or_else(|| AgentError::NotFound(format!("document {}", document_id)))
    }

    /// Delete a document and, by cascade, its chunks. Returns the ids of the
    /// removed chunks.
    pub fn delete_document(&mut self, document_id: &str) -> Result<Vec<String>> {
        let tx = self.conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM chunks WHERE document_id = ?1")?;
            let rows = stmt.query_map(params![document_id], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        let removed = tx.execute("DELETE FROM documents WHERE id = ?1", params![document_id])?;
        if removed == 0 {
            return Err(AgentError::NotFound(format!("document {}", document_id)));
        }
        tx.commit()?;
        log::info!("Deleted document {} ({} chunks)", document_id, ids.len());
        Ok(ids)
    }

    /// Ingested documents, oldest upload first
    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, filename, format, upload_timestamp, chunk_count
             FROM documents WHERE chunk_count > 0
             ORDER BY upload_timestamp, rowid",
        )?;
        let rows = stmt.query_map([], row_to_document)?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }

    /// Every stored chunk id with its embedding, in insertion order
    pub fn all_embeddings(&self) -> Result<Vec<(String, Embedding)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, embedding FROM chunks WHERE embedding IS NOT NULL ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob_to_embedding(&blob)))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drop documents that never received their chunks
    pub fn purge_incomplete(&mut self) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM documents WHERE chunk_count = 0", [])?)
    }

    /// Get total chunk count
    pub fn chunk_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn document_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE chunk_count > 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Get store statistics
    pub fn stats(&self) -> Result<StoreStats> {
        let file_size: i64 = self.conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            document_count: self.document_count()?,
            chunk_count: self.chunk_count()?,
            file_size_bytes: file_size as u64,
        })
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

fn blob_to_embedding(blob: &[u8]) -> Embedding {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn row_to_chunk(row: &Row) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        seq: row.get::<_, i64>(2)? as usize,
        text: row.get(3)?,
        offset: row.get::<_, i64>(4)? as usize,
        length: row.get::<_, i64>(5)? as usize,
    })
}

fn row_to_document(row: &Row) -> rusqlite::Result<DocumentRecord> {
    let format: String = row.get(2)?;
    let format = format
        .parse::<DocumentFormat>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let timestamp: String = row.get(3)?;
    let upload_timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(DocumentRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        format,
        upload_timestamp,
        chunk_count: row.get::<_, i64>(4)? as usize,
    })
}
