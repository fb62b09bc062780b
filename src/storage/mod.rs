//! Storage functionality for knowledge-agent
//!
//! This module provides the document store on embedded SQLite.

pub mod database;
pub mod migrations;
pub mod schema;

// Re-export main types
pub use database::{DocumentRecord, DocumentStore, StoreStats};
