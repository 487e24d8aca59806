// ── Analytics: append-only event log ──────────────────────────────────────
// Writes are best-effort from the caller's point of view: the async
// `record_event` logs and swallows failures so observability never fails a
// request. Transactional writers call `log_event` directly instead.

use super::MemoryStore;
use crate::atoms::error::MemoryResult;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEvent {
    Store,
    DedupHit,
    Search,
    SearchDegraded,
    Archive,
    Delete,
    Usage,
    Verify,
    Assemble,
}

impl AnalyticsEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsEvent::Store => "store",
            AnalyticsEvent::DedupHit => "dedup_hit",
            AnalyticsEvent::Search => "search",
            AnalyticsEvent::SearchDegraded => "search_degraded",
            AnalyticsEvent::Archive => "archive",
            AnalyticsEvent::Delete => "delete",
            AnalyticsEvent::Usage => "usage",
            AnalyticsEvent::Verify => "verify",
            AnalyticsEvent::Assemble => "assemble",
        }
    }
}

pub(crate) fn log_event(
    conn: &Connection,
    event: AnalyticsEvent,
    user_id: Option<&str>,
    memory_id: Option<&str>,
    detail: Option<serde_json::Value>,
) -> MemoryResult<()> {
    let detail = detail.unwrap_or_else(|| serde_json::json!({}));
    conn.execute(
        "INSERT INTO memory_analytics (event, user_id, memory_id, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![event.as_str(), user_id, memory_id, detail, Utc::now()],
    )?;
    Ok(())
}

pub(crate) fn event_counts(conn: &Connection, user_id: &str) -> MemoryResult<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT event, COUNT(*) FROM memory_analytics WHERE user_id = ?1
         GROUP BY event ORDER BY COUNT(*) DESC, event",
    )?;
    let rows = stmt
        .query_map(params![user_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Delete events recorded before `cutoff`. Returns how many went.
pub(crate) fn prune_events(conn: &Connection, cutoff: DateTime<Utc>) -> MemoryResult<usize> {
    Ok(conn.execute("DELETE FROM memory_analytics WHERE created_at < ?1", params![cutoff])?)
}

impl MemoryStore {
    /// Best-effort: failures are logged, never returned.
    pub async fn record_event(
        &self,
        event: AnalyticsEvent,
        user_id: Option<&str>,
        memory_id: Option<&str>,
        detail: Option<serde_json::Value>,
    ) {
        let user_id = user_id.map(str::to_string);
        let memory_id = memory_id.map(str::to_string);
        let result = self
            .pool
            .run("record_event", move |conn| {
                log_event(conn, event, user_id.as_deref(), memory_id.as_deref(), detail.clone())
            })
            .await;
        if let Err(e) = result {
            warn!("[memory] Analytics event {} dropped: {}", event.as_str(), e);
        }
    }

    /// Drop events older than `retention_days`.
    pub async fn prune_events(&self, retention_days: i64) -> MemoryResult<usize> {
        let cutoff = Utc::now() - Duration::days(retention_days.max(0));
        let pruned = self
            .pool
            .run("prune_events", move |conn| prune_events(conn, cutoff))
            .await?;
        if pruned > 0 {
            info!("[memory] Pruned {} analytics events older than {} days", pruned, retention_days);
        }
        Ok(pruned)
    }

    pub async fn event_counts(&self, user_id: &str) -> MemoryResult<Vec<(String, i64)>> {
        let user_id = user_id.to_string();
        self.pool
            .run("event_counts", move |conn| event_counts(conn, &user_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::test_support::conn;

    #[test]
    fn counts_are_per_user() {
        let c = conn();
        log_event(&c, AnalyticsEvent::Search, Some("u1"), None, None).unwrap();
        log_event(&c, AnalyticsEvent::Search, Some("u1"), None, None).unwrap();
        log_event(&c, AnalyticsEvent::SearchDegraded, Some("u1"), None, Some(serde_json::json!({"q": 1}))).unwrap();
        log_event(&c, AnalyticsEvent::Search, Some("u2"), None, None).unwrap();
        let counts = event_counts(&c, "u1").unwrap();
        assert_eq!(
            counts,
            vec![("search".to_string(), 2), ("search_degraded".to_string(), 1)]
        );
    }

    #[test]
    fn prune_drops_only_events_before_cutoff() {
        let c = conn();
        let old = Utc::now() - Duration::days(120);
        c.execute(
            "INSERT INTO memory_analytics (event, user_id, detail, created_at) VALUES ('search', 'u1', '{}', ?1)",
            params![old],
        )
        .unwrap();
        log_event(&c, AnalyticsEvent::Assemble, Some("u1"), None, None).unwrap();

        let pruned = prune_events(&c, Utc::now() - Duration::days(90)).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(event_counts(&c, "u1").unwrap(), vec![("assemble".to_string(), 1)]);
        assert_eq!(prune_events(&c, Utc::now() - Duration::days(90)).unwrap(), 0);
    }
}
