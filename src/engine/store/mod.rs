// Merchant Memory: Memory Store
// Persists memories, prompt fragments, dedup provenance and analytics in
// SQLite, through the connection pool manager.
//
// Module layout:
//   schema      DDL + migrations
//   vector      embedding BLOB codec, cosine similarity
//   memories    memory CRUD, search scans, lifecycle updates, stats
//   duplicates  exact-hash lookup, dedup provenance, merge transitions
//   fragments   prompt fragment CRUD + tier/agent-scoped lookup
//   analytics   append-only event log
//
// Every public method is async and runs its SQL on the blocking pool via
// `ConnectionPool::run`; the sync helpers underneath take a bare
// `&Connection` so unit tests can drive them on a private in-memory db.

mod analytics;
mod duplicates;
mod fragments;
mod memories;
mod schema;
pub mod vector;

use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::Memory;
use crate::engine::pool::ConnectionPool;
use rusqlite::types::Type;
use rusqlite::Connection;
use std::sync::Arc;

pub use analytics::AnalyticsEvent;

/// Column list every memory SELECT uses, in `memory_from_row` order.
pub(crate) const MEMORY_COLUMNS: &str = "id, user_id, content, content_hash, embedding, metadata, \
     category, importance_score, confidence_score, access_count, usefulness_score, decay_rate, \
     verification_status, status, is_ephemeral, created_at, last_accessed_at, updated_at";

/// Thread-safe handle to the memory database.
#[derive(Clone)]
pub struct MemoryStore {
    pool: Arc<ConnectionPool>,
}

impl MemoryStore {
    /// Wrap a pool and make sure the schema exists.
    pub async fn open(pool: Arc<ConnectionPool>) -> MemoryResult<Self> {
        pool.run("migrate", |conn| schema::run_migrations(conn)).await?;
        Ok(MemoryStore { pool })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

/// Initialise an already-open connection with the full schema.
/// Used by tests that drive the sync helpers directly.
pub fn schema_for_testing(conn: &Connection) -> MemoryResult<()> {
    schema::run_migrations(conn)
}

fn conversion_err(idx: usize, e: MemoryError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Map a row selected with `MEMORY_COLUMNS` → Memory.
pub(crate) fn memory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let blob: Option<Vec<u8>> = row.get(4)?;
    let category: String = row.get(6)?;
    let verification: String = row.get(12)?;
    let status: String = row.get(13)?;
    Ok(Memory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        content_hash: row.get(3)?,
        embedding: blob.as_deref().and_then(vector::decode_embedding),
        metadata: row.get(5)?,
        category: category.parse().map_err(|e| conversion_err(6, e))?,
        importance_score: row.get(7)?,
        confidence_score: row.get(8)?,
        access_count: row.get(9)?,
        usefulness_score: row.get(10)?,
        decay_rate: row.get(11)?,
        verification_status: crate::atoms::types::VerificationStatus::parse(&verification),
        status: status.parse().map_err(|e| conversion_err(13, e))?,
        is_ephemeral: row.get(14)?,
        created_at: row.get(15)?,
        last_accessed_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}
