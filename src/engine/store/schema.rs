// Database schema for the memory store.
// Called once by MemoryStore::open() on a pooled connection.
// Adding a table or column: append an idempotent CREATE … IF NOT EXISTS or
// ALTER TABLE … ADD COLUMN (guarded by a pragma_table_info check) at the end
// of run_migrations(). Never edit existing DDL.

use crate::atoms::error::MemoryResult;
use log::info;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> MemoryResult<()> {
    // ── Memories ────────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB,
            metadata TEXT NOT NULL DEFAULT '{}',
            category TEXT NOT NULL DEFAULT 'general',
            importance_score REAL NOT NULL DEFAULT 0.5,
            confidence_score REAL NOT NULL DEFAULT 0.5,
            access_count INTEGER NOT NULL DEFAULT 0,
            usefulness_score REAL NOT NULL DEFAULT 0.5,
            decay_rate REAL NOT NULL DEFAULT 0.015,
            verification_status TEXT NOT NULL DEFAULT 'unverified',
            status TEXT NOT NULL DEFAULT 'active',
            is_ephemeral INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_accessed_at TEXT,
            updated_at TEXT NOT NULL,
            CHECK (importance_score BETWEEN 0.0 AND 1.0),
            CHECK (usefulness_score BETWEEN 0.0 AND 1.0),
            CHECK (access_count >= 0)
        );

        CREATE INDEX IF NOT EXISTS idx_memories_user_status
            ON memories(user_id, status, category, created_at);
        CREATE INDEX IF NOT EXISTS idx_memories_hash
            ON memories(user_id, content_hash);
        CREATE INDEX IF NOT EXISTS idx_memories_status_created
            ON memories(status, created_at);
        ",
    )?;

    // ── Prompt fragments ────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS prompt_fragments (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            content TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            agent_type TEXT,
            context_tier INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_fragments_lookup
            ON prompt_fragments(is_active, context_tier, priority DESC);
        ",
    )?;

    // ── Dedup provenance (append-only) ──────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_duplicates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            original_id TEXT NOT NULL,
            duplicate_content_hash TEXT NOT NULL,
            similarity_score REAL NOT NULL,
            dedup_type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (original_id) REFERENCES memories(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_duplicates_hash
            ON memory_duplicates(duplicate_content_hash);
        CREATE INDEX IF NOT EXISTS idx_duplicates_original
            ON memory_duplicates(original_id);
        ",
    )?;

    // ── Analytics events (append-only, best-effort) ─────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_analytics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event TEXT NOT NULL,
            user_id TEXT,
            memory_id TEXT,
            detail TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_analytics_user_event
            ON memory_analytics(user_id, event);
        CREATE INDEX IF NOT EXISTS idx_analytics_created
            ON memory_analytics(created_at);
        ",
    )?;

    info!("[memory] Schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('memories', 'prompt_fragments', 'memory_duplicates', 'memory_analytics')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn score_checks_reject_out_of_range() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let res = conn.execute(
            "INSERT INTO memories (id, user_id, content, content_hash, importance_score, created_at, updated_at)
             VALUES ('m', 'u', 'c', 'h', 1.5, '2024-01-01', '2024-01-01')",
            [],
        );
        assert!(res.is_err());
    }
}
