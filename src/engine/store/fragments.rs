// ── Prompt fragments ──────────────────────────────────────────────────────
// Curated guidance snippets. A fragment stored at tier T is eligible for T
// and every larger tier, so the tier column holds its rank.

use super::MemoryStore;
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::{ContextTier, PromptFragment};
use chrono::Utc;
use log::info;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

fn tier_rank(tier: ContextTier) -> i64 {
    match tier {
        ContextTier::Core => 0,
        ContextTier::Standard => 1,
        ContextTier::Full => 2,
    }
}

fn tier_from_rank(rank: i64) -> Option<ContextTier> {
    match rank {
        0 => Some(ContextTier::Core),
        1 => Some(ContextTier::Standard),
        2 => Some(ContextTier::Full),
        _ => None,
    }
}

const FRAGMENT_COLUMNS: &str = "id, category, priority, content, tags, agent_type, context_tier, is_active";

fn fragment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptFragment> {
    let tags: String = row.get(4)?;
    let rank: i64 = row.get(6)?;
    let context_tier = tier_from_rank(rank).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            Type::Integer,
            Box::new(MemoryError::validation(format!("bad context tier rank {}", rank))),
        )
    })?;
    let tags: Vec<String> = serde_json::from_str(&tags)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(PromptFragment {
        id: row.get(0)?,
        category: row.get(1)?,
        priority: row.get(2)?,
        content: row.get(3)?,
        tags,
        agent_type: row.get(5)?,
        context_tier,
        is_active: row.get(7)?,
    })
}

pub(crate) fn upsert_sync(conn: &Connection, f: &PromptFragment) -> MemoryResult<()> {
    if f.content.trim().is_empty() {
        return Err(MemoryError::validation("fragment content must not be empty"));
    }
    let now = Utc::now();
    conn.execute(
        "INSERT INTO prompt_fragments (id, category, priority, content, tags, agent_type, context_tier, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(id) DO UPDATE SET
            category = excluded.category,
            priority = excluded.priority,
            content = excluded.content,
            tags = excluded.tags,
            agent_type = excluded.agent_type,
            context_tier = excluded.context_tier,
            is_active = excluded.is_active,
            updated_at = excluded.updated_at",
        params![
            f.id,
            f.category,
            f.priority,
            f.content,
            serde_json::to_string(&f.tags)?,
            f.agent_type,
            tier_rank(f.context_tier),
            f.is_active,
            now
        ],
    )?;
    Ok(())
}

/// Active fragments for an agent (agent-specific or global) eligible at
/// `tier`, highest priority first.
pub(crate) fn eligible_sync(
    conn: &Connection,
    agent_type: Option<&str>,
    tier: ContextTier,
    limit: usize,
) -> MemoryResult<Vec<PromptFragment>> {
    let sql = format!(
        "SELECT {} FROM prompt_fragments
         WHERE is_active = 1
           AND context_tier <= ?1
           AND (agent_type IS NULL OR agent_type = ?2)
         ORDER BY priority DESC, category, id
         LIMIT ?3",
        FRAGMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![tier_rank(tier), agent_type, limit as i64], fragment_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn list_sync(conn: &Connection, include_inactive: bool) -> MemoryResult<Vec<PromptFragment>> {
    let sql = format!(
        "SELECT {} FROM prompt_fragments
         WHERE (?1 = 1 OR is_active = 1)
         ORDER BY priority DESC, category, id",
        FRAGMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![include_inactive], fragment_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

impl MemoryStore {
    pub async fn upsert_fragment(&self, fragment: PromptFragment) -> MemoryResult<String> {
        let id = fragment.id.clone();
        self.pool
            .run("upsert_fragment", move |conn| upsert_sync(conn, &fragment))
            .await?;
        info!("[memory] Saved prompt fragment {}", id);
        Ok(id)
    }

    pub async fn get_fragment(&self, id: &str) -> MemoryResult<Option<PromptFragment>> {
        let id = id.to_string();
        self.pool
            .run("get_fragment", move |conn| {
                let sql = format!("SELECT {} FROM prompt_fragments WHERE id = ?1", FRAGMENT_COLUMNS);
                Ok(conn.query_row(&sql, params![id], fragment_from_row).optional()?)
            })
            .await
    }

    /// Enable or disable a fragment. False when the id is unknown.
    pub async fn set_fragment_active(&self, id: &str, active: bool) -> MemoryResult<bool> {
        let id = id.to_string();
        self.pool
            .run("set_fragment_active", move |conn| {
                let n = conn.execute(
                    "UPDATE prompt_fragments SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, active, Utc::now()],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn fragments_for(
        &self,
        agent_type: Option<&str>,
        tier: ContextTier,
        limit: usize,
    ) -> MemoryResult<Vec<PromptFragment>> {
        let agent_type = agent_type.map(str::to_string);
        self.pool
            .run("fragments_for", move |conn| eligible_sync(conn, agent_type.as_deref(), tier, limit))
            .await
    }

    pub async fn list_fragments(&self, include_inactive: bool) -> MemoryResult<Vec<PromptFragment>> {
        self.pool
            .run("list_fragments", move |conn| list_sync(conn, include_inactive))
            .await
    }
}
