// ── Memory rows: CRUD, search scans, lifecycle updates, stats ─────────────

use super::analytics;
use super::vector::{cosine_similarity, encode_embedding};
use super::{memory_from_row, MemoryStore, MEMORY_COLUMNS};
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::{
    check_unit_interval, Memory, MemoryCategory, MemoryId, MemoryStats, MemoryStatus, SearchResult,
};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::cmp::Ordering;

// ═══════════════════════════════════════════════════════════════════════════
// Sync helpers (one connection, no retries)
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) fn insert_row(conn: &Connection, m: &Memory) -> MemoryResult<()> {
    let blob = m.embedding.as_deref().map(encode_embedding);
    conn.execute(
        &format!(
            "INSERT INTO memories ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            MEMORY_COLUMNS
        ),
        params![
            m.id,
            m.user_id,
            m.content,
            m.content_hash,
            blob,
            m.metadata,
            m.category.as_str(),
            m.importance_score,
            m.confidence_score,
            m.access_count,
            m.usefulness_score,
            m.decay_rate,
            m.verification_status.as_str(),
            m.status.as_str(),
            m.is_ephemeral,
            m.created_at,
            m.last_accessed_at,
            m.updated_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn get_row(conn: &Connection, id: &str) -> MemoryResult<Option<Memory>> {
    let sql = format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS);
    Ok(conn.query_row(&sql, params![id], memory_from_row).optional()?)
}

/// The user's most recent active memories of one category, newest first.
/// This is the comparison window for the fuzzy, key-phrase and semantic
/// dedup layers.
pub(crate) fn window_rows(
    conn: &Connection,
    user_id: &str,
    category: MemoryCategory,
    limit: usize,
) -> MemoryResult<Vec<Memory>> {
    let sql = format!(
        "SELECT {} FROM memories
         WHERE user_id = ?1 AND category = ?2 AND status = 'active'
         ORDER BY created_at DESC, id DESC
         LIMIT ?3",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![user_id, category.as_str(), limit as i64], memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn active_rows(
    conn: &Connection,
    user_id: &str,
    category: Option<MemoryCategory>,
    with_embedding_only: bool,
) -> MemoryResult<Vec<Memory>> {
    let sql = format!(
        "SELECT {} FROM memories
         WHERE user_id = ?1 AND status = 'active'
           AND (?2 IS NULL OR category = ?2)
           AND (?3 = 0 OR embedding IS NOT NULL)",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![user_id, category.map(|c| c.as_str()), with_embedding_only],
            memory_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Bump access counters for the given rows inside the caller's transaction.
pub(crate) fn touch_rows(conn: &Connection, ids: &[&str], now: DateTime<Utc>) -> MemoryResult<()> {
    let mut stmt = conn.prepare(
        "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?2 WHERE id = ?1",
    )?;
    for id in ids {
        stmt.execute(params![id, now])?;
    }
    Ok(())
}

/// Order by similarity desc, ties by importance desc, then rank 1..n.
pub(crate) fn rank_results(mut scored: Vec<(Memory, f64)>, limit: usize) -> Vec<SearchResult> {
    scored.sort_by(|(ma, sa), (mb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                mb.importance_score
                    .partial_cmp(&ma.importance_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| mb.created_at.cmp(&ma.created_at))
    });
    scored
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, (memory, similarity_score))| SearchResult {
            memory,
            similarity_score,
            rank: i + 1,
        })
        .collect()
}

/// Record the access on the returned rows (same transaction as the read)
/// and reflect it in the returned values.
fn finish_search(
    conn: &mut Connection,
    mut results: Vec<SearchResult>,
) -> MemoryResult<Vec<SearchResult>> {
    if results.is_empty() {
        return Ok(results);
    }
    let now = Utc::now();
    let tx = conn.transaction()?;
    {
        let ids: Vec<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
        touch_rows(&tx, &ids, now)?;
    }
    tx.commit()?;
    for r in results.iter_mut() {
        r.memory.access_count += 1;
        r.memory.last_accessed_at = Some(now);
    }
    Ok(results)
}

pub(crate) fn search_by_embedding_sync(
    conn: &mut Connection,
    user_id: &str,
    query: &[f32],
    limit: usize,
    category: Option<MemoryCategory>,
    threshold: f64,
) -> MemoryResult<Vec<SearchResult>> {
    let candidates = active_rows(conn, user_id, category, true)?;
    let scanned = candidates.len();
    let scored: Vec<(Memory, f64)> = candidates
        .into_iter()
        .filter_map(|m| {
            let sim = m.embedding.as_deref().map(|e| cosine_similarity(query, e))?;
            (sim >= threshold).then_some((m, sim))
        })
        .collect();
    debug!(
        "[memory] Cosine scan for {}: {} rows, {} above {:.2}",
        user_id,
        scanned,
        scored.len(),
        threshold
    );
    let ranked = rank_results(scored, limit);
    finish_search(conn, ranked)
}

/// Terms of the degraded text search: the whole query plus each word of
/// at least four characters.
pub(crate) fn text_search_terms(query: &str) -> Vec<String> {
    let whole = query.trim().to_lowercase();
    let mut terms = Vec::new();
    if !whole.is_empty() {
        terms.push(whole);
    }
    for word in query.split(|c: char| !c.is_alphanumeric()) {
        let w = word.to_lowercase();
        if w.chars().count() >= 4 && !terms.contains(&w) {
            terms.push(w);
        }
    }
    terms
}

pub(crate) fn search_text_sync(
    conn: &mut Connection,
    user_id: &str,
    query: &str,
    limit: usize,
    category: Option<MemoryCategory>,
) -> MemoryResult<Vec<SearchResult>> {
    let terms = text_search_terms(query);
    if terms.is_empty() {
        return Ok(Vec::new());
    }
    // SQLite's LOWER() only folds ASCII, so terms are matched here instead.
    let sql = format!(
        "SELECT {} FROM memories
         WHERE user_id = ?1 AND status = 'active' AND (?2 IS NULL OR category = ?2)",
        MEMORY_COLUMNS
    );
    let mut hits: Vec<Memory> = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id, category.map(|c| c.as_str())], memory_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .filter(|m| {
                let content = m.content.to_lowercase();
                let cat = m.category.as_str();
                terms.iter().any(|t| content.contains(t.as_str()) || cat.contains(t.as_str()))
            })
            .collect()
    };
    hits.sort_by(|a, b| {
        b.importance_score
            .partial_cmp(&a.importance_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    let results = hits
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, memory)| SearchResult {
            memory,
            similarity_score: 1.0,
            rank: i + 1,
        })
        .collect();
    finish_search(conn, results)
}

pub(crate) fn update_importance_sync(conn: &Connection, id: &str, score: f64) -> MemoryResult<f64> {
    if score.is_nan() {
        return Err(MemoryError::validation("importance score must be a number"));
    }
    let clamped = score.clamp(0.0, 1.0);
    let n = conn.execute(
        "UPDATE memories SET importance_score = ?2, updated_at = ?3
         WHERE id = ?1 AND status != 'deleted'",
        params![id, clamped, Utc::now()],
    )?;
    if n == 0 {
        return Err(MemoryError::not_found(format!("memory {}", id)));
    }
    Ok(clamped)
}

pub(crate) fn soft_delete_sync(conn: &mut Connection, id: &str, user_id: &str) -> MemoryResult<bool> {
    let tx = conn.transaction()?;
    let n = tx.execute(
        "UPDATE memories SET status = 'deleted', updated_at = ?3
         WHERE id = ?1 AND user_id = ?2 AND status IN ('active', 'archived')",
        params![id, user_id, Utc::now()],
    )?;
    if n == 0 {
        return Ok(false);
    }
    tx.execute("DELETE FROM memory_duplicates WHERE original_id = ?1", params![id])?;
    analytics::log_event(&tx, analytics::AnalyticsEvent::Delete, Some(user_id), Some(id), None)?;
    tx.commit()?;
    Ok(true)
}

/// Move one row out of `active`. Returns false when it already left.
pub(crate) fn transition_sync(conn: &Connection, id: &str, to: MemoryStatus) -> MemoryResult<bool> {
    let n = conn.execute(
        "UPDATE memories SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = 'active'",
        params![id, to.as_str(), Utc::now()],
    )?;
    Ok(n > 0)
}

pub(crate) fn adjust_usefulness_sync(conn: &Connection, id: &str, delta: f64) -> MemoryResult<Option<f64>> {
    let n = conn.execute(
        "UPDATE memories
         SET usefulness_score = MAX(0.0, MIN(1.0, usefulness_score + ?2)), updated_at = ?3
         WHERE id = ?1 AND status = 'active'",
        params![id, delta, Utc::now()],
    )?;
    if n == 0 {
        return Ok(None);
    }
    let score: f64 = conn.query_row(
        "SELECT usefulness_score FROM memories WHERE id = ?1",
        params![id],
        |r| r.get(0),
    )?;
    Ok(Some(score))
}

pub(crate) fn verify_sync(
    conn: &Connection,
    id: &str,
    importance_multiplier: f64,
    decay_multiplier: f64,
    usefulness_bonus: f64,
) -> MemoryResult<bool> {
    let n = conn.execute(
        "UPDATE memories
         SET importance_score = MIN(1.0, importance_score * ?2),
             decay_rate = decay_rate * ?3,
             usefulness_score = MIN(1.0, usefulness_score + ?4),
             verification_status = 'verified',
             updated_at = ?5
         WHERE id = ?1 AND verification_status = 'unverified' AND status != 'deleted'",
        params![id, importance_multiplier, decay_multiplier, usefulness_bonus, Utc::now()],
    )?;
    if n == 0 {
        let exists: bool = conn
            .query_row("SELECT 1 FROM memories WHERE id = ?1 AND status != 'deleted'", params![id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(MemoryError::not_found(format!("memory {}", id)));
        }
        return Ok(false);
    }
    Ok(true)
}

/// Active rows with `id > after`, ordered by id, for keyset-paginated sweeps.
pub(crate) fn active_page(conn: &Connection, after: &str, limit: usize) -> MemoryResult<Vec<Memory>> {
    let sql = format!(
        "SELECT {} FROM memories WHERE status = 'active' AND id > ?1 ORDER BY id LIMIT ?2",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![after, limit as i64], memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn list_sync(
    conn: &Connection,
    user_id: &str,
    status: Option<MemoryStatus>,
    category: Option<MemoryCategory>,
    limit: usize,
) -> MemoryResult<Vec<Memory>> {
    let sql = format!(
        "SELECT {} FROM memories
         WHERE user_id = ?1
           AND (?2 IS NULL OR status = ?2)
           AND (?3 IS NULL OR category = ?3)
         ORDER BY importance_score DESC, created_at DESC
         LIMIT ?4",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                user_id,
                status.map(|s| s.as_str()),
                category.map(|c| c.as_str()),
                limit as i64
            ],
            memory_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// All of a user's active rows, oldest first (dedup sweep order).
pub(crate) fn active_oldest_first(conn: &Connection, user_id: &str) -> MemoryResult<Vec<Memory>> {
    let sql = format!(
        "SELECT {} FROM memories WHERE user_id = ?1 AND status = 'active'
         ORDER BY created_at ASC, id ASC",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![user_id], memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn without_embeddings(conn: &Connection, limit: usize) -> MemoryResult<Vec<(MemoryId, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, content FROM memories
         WHERE embedding IS NULL AND status = 'active'
         ORDER BY created_at DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn stats_sync(conn: &Connection, user_id: &str) -> MemoryResult<MemoryStats> {
    let mut stats = MemoryStats {
        user_id: user_id.to_string(),
        ..Default::default()
    };

    {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM memories WHERE user_id = ?1 GROUP BY status")?;
        let rows = stmt.query_map(params![user_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            stats.total += n;
            match status.as_str() {
                "active" => stats.active = n,
                "archived" => stats.archived = n,
                "deduplicated" => stats.deduplicated = n,
                "deleted" => stats.deleted = n,
                _ => {}
            }
        }
    }

    {
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) FROM memories
             WHERE user_id = ?1 AND status = 'active'
             GROUP BY category ORDER BY COUNT(*) DESC, category",
        )?;
        stats.categories = stmt
            .query_map(params![user_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
    }

    let (avg_imp, avg_use, avg_acc, with_emb, eph, verified): (Option<f64>, Option<f64>, Option<f64>, i64, i64, i64) =
        conn.query_row(
            "SELECT AVG(importance_score), AVG(usefulness_score), AVG(access_count),
                    COALESCE(SUM(embedding IS NOT NULL), 0),
                    COALESCE(SUM(is_ephemeral), 0),
                    COALESCE(SUM(verification_status = 'verified'), 0)
             FROM memories WHERE user_id = ?1 AND status = 'active'",
            params![user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )?;
    stats.avg_importance = avg_imp.unwrap_or(0.0);
    stats.avg_usefulness = avg_use.unwrap_or(0.0);
    stats.avg_access_count = avg_acc.unwrap_or(0.0);
    stats.with_embeddings = with_emb;
    stats.ephemeral = eph;
    stats.verified = verified;

    stats.duplicate_records = conn.query_row(
        "SELECT COUNT(*) FROM memory_duplicates d JOIN memories m ON m.id = d.original_id
         WHERE m.user_id = ?1",
        params![user_id],
        |r| r.get(0),
    )?;
    stats.events = analytics::event_counts(conn, user_id)?;
    Ok(stats)
}

// ═══════════════════════════════════════════════════════════════════════════
// Async API
// ═══════════════════════════════════════════════════════════════════════════

impl MemoryStore {
    /// Insert a fully-built row. Callers run dedup first.
    pub async fn insert(&self, memory: Memory) -> MemoryResult<MemoryId> {
        let id = memory.id.clone();
        self.pool
            .run("insert_memory", move |conn| {
                let tx = conn.transaction()?;
                insert_row(&tx, &memory)?;
                analytics::log_event(
                    &tx,
                    analytics::AnalyticsEvent::Store,
                    Some(&memory.user_id),
                    Some(&memory.id),
                    Some(serde_json::json!({ "category": memory.category.as_str() })),
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        info!("[memory] Stored {}", id);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> MemoryResult<Option<Memory>> {
        let id = id.to_string();
        self.pool.run("get_memory", move |conn| get_row(conn, &id)).await
    }

    pub async fn list(
        &self,
        user_id: &str,
        status: Option<MemoryStatus>,
        limit: usize,
    ) -> MemoryResult<Vec<Memory>> {
        let user_id = user_id.to_string();
        self.pool
            .run("list_memories", move |conn| list_sync(conn, &user_id, status, None, limit))
            .await
    }

    /// Active rows of one category, importance desc then newest first.
    pub async fn get_by_category(
        &self,
        user_id: &str,
        category: MemoryCategory,
        limit: usize,
    ) -> MemoryResult<Vec<Memory>> {
        let user_id = user_id.to_string();
        self.pool
            .run("get_by_category", move |conn| {
                list_sync(conn, &user_id, Some(MemoryStatus::Active), Some(category), limit)
            })
            .await
    }

    pub async fn window(
        &self,
        user_id: &str,
        category: MemoryCategory,
        limit: usize,
    ) -> MemoryResult<Vec<Memory>> {
        let user_id = user_id.to_string();
        self.pool
            .run("dedup_window", move |conn| window_rows(conn, &user_id, category, limit))
            .await
    }

    /// Cosine-ranked search over the user's active rows with embeddings.
    pub async fn search_by_embedding(
        &self,
        user_id: &str,
        query: Vec<f32>,
        limit: usize,
        category: Option<MemoryCategory>,
        threshold: f64,
    ) -> MemoryResult<Vec<SearchResult>> {
        let user_id = user_id.to_string();
        self.pool
            .run("search_by_embedding", move |conn| {
                search_by_embedding_sync(conn, &user_id, &query, limit, category, threshold)
            })
            .await
    }

    /// Substring search used when no query embedding is available.
    pub async fn search_text(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        category: Option<MemoryCategory>,
    ) -> MemoryResult<Vec<SearchResult>> {
        let user_id = user_id.to_string();
        let query = query.to_string();
        self.pool
            .run("search_text", move |conn| search_text_sync(conn, &user_id, &query, limit, category))
            .await
    }

    /// Set importance, clamped to [0,1]. Returns the stored value.
    pub async fn update_importance(&self, id: &str, score: f64) -> MemoryResult<f64> {
        if score.is_nan() {
            return Err(MemoryError::validation("importance score must be a number"));
        }
        let id = id.to_string();
        self.pool
            .run("update_importance", move |conn| update_importance_sync(conn, &id, score))
            .await
    }

    /// Owner-scoped soft delete.
    pub async fn delete(&self, id: &str, user_id: &str) -> MemoryResult<bool> {
        let id = id.to_string();
        let user_id = user_id.to_string();
        let deleted = self
            .pool
            .run("delete_memory", move |conn| soft_delete_sync(conn, &id, &user_id))
            .await?;
        Ok(deleted)
    }

    pub async fn set_status(&self, id: &str, status: MemoryStatus) -> MemoryResult<bool> {
        let id = id.to_string();
        self.pool
            .run("set_status", move |conn| transition_sync(conn, &id, status))
            .await
    }

    /// Add `delta` to usefulness (clamped). None when the row is not active.
    pub async fn adjust_usefulness(&self, id: &str, delta: f64) -> MemoryResult<Option<f64>> {
        check_unit_interval("usefulness delta", delta.abs())?;
        let id = id.to_string();
        self.pool
            .run("adjust_usefulness", move |conn| adjust_usefulness_sync(conn, &id, delta))
            .await
    }

    pub async fn verify(
        &self,
        id: &str,
        importance_multiplier: f64,
        decay_multiplier: f64,
        usefulness_bonus: f64,
    ) -> MemoryResult<bool> {
        let id = id.to_string();
        self.pool
            .run("verify_memory", move |conn| {
                verify_sync(conn, &id, importance_multiplier, decay_multiplier, usefulness_bonus)
            })
            .await
    }

    pub async fn active_page(&self, after: &str, limit: usize) -> MemoryResult<Vec<Memory>> {
        let after = after.to_string();
        self.pool
            .run("active_page", move |conn| active_page(conn, &after, limit))
            .await
    }

    pub async fn active_oldest_first(&self, user_id: &str) -> MemoryResult<Vec<Memory>> {
        let user_id = user_id.to_string();
        self.pool
            .run("active_oldest_first", move |conn| active_oldest_first(conn, &user_id))
            .await
    }

    pub async fn list_without_embeddings(&self, limit: usize) -> MemoryResult<Vec<(MemoryId, String)>> {
        self.pool
            .run("list_without_embeddings", move |conn| without_embeddings(conn, limit))
            .await
    }

    /// Fill in a missing embedding. Never overwrites an existing one.
    pub async fn set_embedding(&self, id: &str, embedding: Vec<f32>) -> MemoryResult<bool> {
        let id = id.to_string();
        let blob = encode_embedding(&embedding);
        self.pool
            .run("set_embedding", move |conn| {
                let n = conn.execute(
                    "UPDATE memories SET embedding = ?2 WHERE id = ?1 AND embedding IS NULL",
                    params![id, blob],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn stats(&self, user_id: &str) -> MemoryResult<MemoryStats> {
        let user_id = user_id.to_string();
        self.pool.run("memory_stats", move |conn| stats_sync(conn, &user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::test_support::{conn, memory};
    use chrono::Duration;

    #[test]
    fn insert_and_get_round_trip() {
        let c = conn();
        let mut m = memory("u1", "Prefers shipping via UPS Ground", MemoryCategory::Preferences);
        m.embedding = Some(vec![0.1, 0.2, 0.3]);
        m.metadata = serde_json::json!({"source": "chat"});
        insert_row(&c, &m).unwrap();
        let back = get_row(&c, &m.id).unwrap().unwrap();
        assert_eq!(back.content, m.content);
        assert_eq!(back.embedding, m.embedding);
        assert_eq!(back.metadata["source"], "chat");
        assert_eq!(back.category, MemoryCategory::Preferences);
        assert_eq!(back.status, MemoryStatus::Active);
        assert!(get_row(&c, "missing").unwrap().is_none());
    }

    #[test]
    fn embedding_search_orders_by_similarity_then_importance() {
        let mut c = conn();
        let mut a = memory("u1", "a", MemoryCategory::Facts);
        a.embedding = Some(vec![1.0, 0.0]);
        a.importance_score = 0.2;
        let mut b = memory("u1", "b", MemoryCategory::Facts);
        b.embedding = Some(vec![1.0, 0.0]);
        b.importance_score = 0.9;
        let mut d = memory("u1", "d", MemoryCategory::Facts);
        d.embedding = Some(vec![0.6, 0.8]);
        let mut far = memory("u1", "far", MemoryCategory::Facts);
        far.embedding = Some(vec![0.0, 1.0]);
        let mut other_user = memory("u2", "b", MemoryCategory::Facts);
        other_user.embedding = Some(vec![1.0, 0.0]);
        for m in [&a, &b, &d, &far, &other_user] {
            insert_row(&c, m).unwrap();
        }

        let res = search_by_embedding_sync(&mut c, "u1", &[1.0, 0.0], 10, None, 0.5).unwrap();
        let ids: Vec<&str> = res.iter().map(|r| r.memory.content.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "d"]);
        assert_eq!(res[0].rank, 1);
        assert!(res.windows(2).all(|w| w[0].similarity_score >= w[1].similarity_score));
        assert_eq!(res[0].memory.access_count, 1);

        let stored = get_row(&c, &b.id).unwrap().unwrap();
        assert_eq!(stored.access_count, 1);
        assert!(stored.last_accessed_at.is_some());
        let untouched = get_row(&c, &far.id).unwrap().unwrap();
        assert_eq!(untouched.access_count, 0);
    }

    #[test]
    fn embedding_search_respects_category_and_limit() {
        let mut c = conn();
        for (i, cat) in [MemoryCategory::Facts, MemoryCategory::Problems, MemoryCategory::Facts]
            .into_iter()
            .enumerate()
        {
            let mut m = memory("u1", &format!("m{}", i), cat);
            m.embedding = Some(vec![1.0, 0.1 * i as f32]);
            insert_row(&c, &m).unwrap();
        }
        let res =
            search_by_embedding_sync(&mut c, "u1", &[1.0, 0.0], 1, Some(MemoryCategory::Facts), 0.0).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].memory.category, MemoryCategory::Facts);
    }

    #[test]
    fn text_search_matches_terms_and_category() {
        let mut c = conn();
        let mut hi = memory("u1", "Main supplier is Acme Corp", MemoryCategory::Relationships);
        hi.importance_score = 0.9;
        let lo = memory("u1", "Acme invoices arrive monthly", MemoryCategory::Facts);
        let unrelated = memory("u1", "Uses Shopify", MemoryCategory::Facts);
        for m in [&hi, &lo, &unrelated] {
            insert_row(&c, m).unwrap();
        }
        let res = search_text_sync(&mut c, "u1", "who is acme?", 10, None).unwrap();
        let contents: Vec<&str> = res.iter().map(|r| r.memory.content.as_str()).collect();
        assert_eq!(contents, vec!["Main supplier is Acme Corp", "Acme invoices arrive monthly"]);
        assert!(res.iter().all(|r| r.similarity_score == 1.0));

        let by_cat = search_text_sync(&mut c, "u1", "relationships", 10, None).unwrap();
        assert_eq!(by_cat.len(), 1);
    }

    #[test]
    fn text_search_terms_keep_whole_query_and_long_words() {
        assert_eq!(
            text_search_terms("what coffee do they like"),
            vec!["what coffee do they like", "what", "coffee", "they", "like"]
        );
        assert!(text_search_terms("   ").is_empty());
    }

    #[test]
    fn text_search_folds_non_ascii_case() {
        let mut c = conn();
        insert_row(&c, &memory("u1", "Morning order is always a CAFÉ CRÈME", MemoryCategory::Preferences)).unwrap();
        let res = search_text_sync(&mut c, "u1", "café crème", 10, None).unwrap();
        assert_eq!(res.len(), 1);
        let res = search_text_sync(&mut c, "u1", "crème", 10, None).unwrap();
        assert_eq!(res.len(), 1);
    }

    #[test]
    fn wildcard_characters_match_literally() {
        let mut c = conn();
        insert_row(&c, &memory("u1", "discount is 50% off", MemoryCategory::Facts)).unwrap();
        insert_row(&c, &memory("u1", "discount is 50 dollars", MemoryCategory::Facts)).unwrap();
        let res = search_text_sync(&mut c, "u1", "50%", 10, None).unwrap();
        assert_eq!(res.len(), 1);
    }

    #[test]
    fn update_importance_clamps_and_reports_missing() {
        let c = conn();
        let m = memory("u1", "x", MemoryCategory::General);
        insert_row(&c, &m).unwrap();
        assert_eq!(update_importance_sync(&c, &m.id, 1.7).unwrap(), 1.0);
        assert_eq!(update_importance_sync(&c, &m.id, -3.0).unwrap(), 0.0);
        assert!(matches!(update_importance_sync(&c, "nope", 0.5), Err(MemoryError::NotFound(_))));
        assert!(matches!(update_importance_sync(&c, &m.id, f64::NAN), Err(MemoryError::Validation(_))));
    }

    #[test]
    fn soft_delete_is_owner_scoped() {
        let mut c = conn();
        let m = memory("u1", "x", MemoryCategory::General);
        insert_row(&c, &m).unwrap();
        assert!(!soft_delete_sync(&mut c, &m.id, "u2").unwrap());
        assert!(soft_delete_sync(&mut c, &m.id, "u1").unwrap());
        assert!(!soft_delete_sync(&mut c, &m.id, "u1").unwrap());
        assert_eq!(get_row(&c, &m.id).unwrap().unwrap().status, MemoryStatus::Deleted);
    }

    #[test]
    fn usefulness_is_clamped() {
        let c = conn();
        let m = memory("u1", "x", MemoryCategory::General);
        insert_row(&c, &m).unwrap();
        for _ in 0..10 {
            adjust_usefulness_sync(&c, &m.id, 0.1).unwrap();
        }
        assert_eq!(adjust_usefulness_sync(&c, &m.id, 0.1).unwrap(), Some(1.0));
        for _ in 0..30 {
            adjust_usefulness_sync(&c, &m.id, -0.05).unwrap();
        }
        let v = adjust_usefulness_sync(&c, &m.id, -0.05).unwrap().unwrap();
        assert!(v.abs() < 1e-12);
        assert_eq!(adjust_usefulness_sync(&c, "nope", 0.1).unwrap(), None);
    }

    #[test]
    fn verify_is_idempotent() {
        let c = conn();
        let mut m = memory("u1", "x", MemoryCategory::Facts);
        m.importance_score = 0.9;
        insert_row(&c, &m).unwrap();
        assert!(verify_sync(&c, &m.id, 1.2, 0.8, 0.2).unwrap());
        assert!(!verify_sync(&c, &m.id, 1.2, 0.8, 0.2).unwrap());
        let v = get_row(&c, &m.id).unwrap().unwrap();
        assert_eq!(v.importance_score, 1.0);
        assert!((v.decay_rate - 0.008 * 0.8).abs() < 1e-12);
        assert!((v.usefulness_score - 0.7).abs() < 1e-12);
        assert!(matches!(verify_sync(&c, "nope", 1.2, 0.8, 0.2), Err(MemoryError::NotFound(_))));
    }

    #[test]
    fn active_page_walks_by_id() {
        let c = conn();
        for i in 0..5 {
            insert_row(&c, &memory("u1", &format!("m{}", i), MemoryCategory::General)).unwrap();
        }
        let first = active_page(&c, "", 3).unwrap();
        assert_eq!(first.len(), 3);
        let rest = active_page(&c, &first[2].id, 3).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|m| m.id > first[2].id));
    }

    #[test]
    fn stats_counts_by_status_and_category() {
        let mut c = conn();
        let a = memory("u1", "a", MemoryCategory::Facts);
        let b = memory("u1", "b", MemoryCategory::Facts);
        let mut old = memory("u1", "c", MemoryCategory::Preferences);
        old.created_at = Utc::now() - Duration::days(3);
        for m in [&a, &b, &old] {
            insert_row(&c, m).unwrap();
        }
        transition_sync(&c, &old.id, MemoryStatus::Archived).unwrap();
        soft_delete_sync(&mut c, &b.id, "u1").unwrap();

        let s = stats_sync(&c, "u1").unwrap();
        assert_eq!(s.total, 3);
        assert_eq!(s.active, 1);
        assert_eq!(s.archived, 1);
        assert_eq!(s.deleted, 1);
        assert_eq!(s.categories, vec![("facts".to_string(), 1)]);
        assert!(s.events.iter().any(|(e, n)| e == "delete" && *n == 1));
    }
}
