//! Database migrations and compatibility

use crate::error::{AgentError, Result};
use crate::storage::schema::*;
use rusqlite::{Connection, OptionalExtension, params};

/// Known migrations, oldest first
const MIGRATIONS: &[(&str, &str)] = &[
    ("initial_schema", "Documents, chunks and metadata tables"),
    ("add_lookup_indices", "Per-document chunk and upload-time indices"),
];

/// Applies pending migrations to an open connection
pub struct MigrationManager<'a> {
    conn: &'a Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Run all pending migrations
    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(CREATE_MIGRATIONS_TABLE)?;
        let applied = self.applied_versions()?;

        for (version, description) in MIGRATIONS {
            if applied.iter().any(|v| v == version) {
                continue;
            }
            log::info!("Applying migration: {} - {}", version, description);
            self.apply_migration(version)?;
            self.conn.execute(
                "INSERT INTO migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, chrono::Utc::now().to_rfc3339()],
            )?;
        }
        Ok(())
    }

    fn applied_versions(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT version FROM migrations")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }

    fn apply_migration(&self, version: &str) -> Result<()> {
        match version {
            "initial_schema" => {
                self.conn.execute_batch(CREATE_DOCUMENTS_TABLE)?;
                self.conn.execute_batch(CREATE_CHUNKS_TABLE)?;
                self.conn.execute_batch(CREATE_METADATA_TABLE)?;
                Ok(())
            }
            "add_lookup_indices" => {
                self.conn.execute_batch(CREATE_CHUNKS_INDEXES)?;
                Ok(())
            }
            _ => Err(AgentError::Storage(format!(
                "Unknown migration version: {}",
                version
            ))),
        }
    }

    /// Most recently applied migration
    pub fn current_version(&self) -> Result<Option<String>> {
        let version = self
            .conn
            .query_row(
                "SELECT version FROM migrations ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(version)
    }

    /// Check if database is up to date
    pub fn is_up_to_date(&self) -> Result<bool> {
        let latest = MIGRATIONS.last().map(|(v, _)| *v);
        Ok(self.current_version()?.as_deref() == latest)
    }
}
