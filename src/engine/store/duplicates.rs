// ── Dedup provenance: exact-hash lookup, duplicate records, merges ───────

use super::analytics::{log_event, AnalyticsEvent};
use super::MemoryStore;
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::{DuplicateRecord, MemoryId};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

/// Active memory of this user whose normalized content hashes to `hash`,
/// either directly or through a recorded duplicate.
pub(crate) fn find_by_hash(conn: &Connection, user_id: &str, hash: &str) -> MemoryResult<Option<MemoryId>> {
    let direct: Option<MemoryId> = conn
        .query_row(
            "SELECT id FROM memories
             WHERE user_id = ?1 AND content_hash = ?2 AND status = 'active'
             ORDER BY created_at ASC LIMIT 1",
            params![user_id, hash],
            |r| r.get(0),
        )
        .optional()?;
    if direct.is_some() {
        return Ok(direct);
    }
    Ok(conn
        .query_row(
            "SELECT m.id FROM memory_duplicates d
             JOIN memories m ON m.id = d.original_id
             WHERE m.user_id = ?1 AND d.duplicate_content_hash = ?2 AND m.status = 'active'
             ORDER BY d.created_at ASC LIMIT 1",
            params![user_id, hash],
            |r| r.get(0),
        )
        .optional()?)
}

fn insert_record(conn: &Connection, rec: &DuplicateRecord) -> MemoryResult<()> {
    conn.execute(
        "INSERT INTO memory_duplicates (original_id, duplicate_content_hash, similarity_score, dedup_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            rec.original_id,
            rec.duplicate_content_hash,
            rec.similarity_score,
            rec.dedup_type.as_str(),
            rec.created_at
        ],
    )?;
    Ok(())
}

/// Merge a rejected candidate into its original: append the record and bump
/// the original's access counters, atomically. Fails with NotFound when the
/// original left `active` in the meantime.
pub(crate) fn record_hit_sync(conn: &mut Connection, user_id: &str, rec: &DuplicateRecord) -> MemoryResult<()> {
    let tx = conn.transaction()?;
    let n = tx.execute(
        "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?2
         WHERE id = ?1 AND status = 'active'",
        params![rec.original_id, rec.created_at],
    )?;
    if n == 0 {
        return Err(MemoryError::not_found(format!("active memory {}", rec.original_id)));
    }
    insert_record(&tx, rec)?;
    log_event(
        &tx,
        AnalyticsEvent::DedupHit,
        Some(user_id),
        Some(&rec.original_id),
        Some(serde_json::json!({
            "dedup_type": rec.dedup_type.as_str(),
            "similarity": rec.similarity_score,
        })),
    )?;
    tx.commit()?;
    Ok(())
}

/// Retire `duplicate_id` in favour of the record's original.
pub(crate) fn merge_into_sync(conn: &mut Connection, duplicate_id: &str, rec: &DuplicateRecord) -> MemoryResult<bool> {
    let tx = conn.transaction()?;
    let n = tx.execute(
        "UPDATE memories SET status = 'deduplicated', updated_at = ?2 WHERE id = ?1 AND status = 'active'",
        params![duplicate_id, Utc::now()],
    )?;
    if n == 0 {
        return Ok(false);
    }
    // Anything that pointed at the retired row now points at the survivor.
    tx.execute(
        "UPDATE memory_duplicates SET original_id = ?2 WHERE original_id = ?1",
        params![duplicate_id, rec.original_id],
    )?;
    insert_record(&tx, rec)?;
    tx.commit()?;
    Ok(true)
}

pub(crate) fn records_for(conn: &Connection, original_id: &str) -> MemoryResult<Vec<DuplicateRecord>> {
    let mut stmt = conn.prepare(
        "SELECT original_id, duplicate_content_hash, similarity_score, dedup_type, created_at
         FROM memory_duplicates WHERE original_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![original_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, chrono::DateTime<Utc>>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(original_id, hash, score, kind, created_at)| -> MemoryResult<DuplicateRecord> {
            Ok(DuplicateRecord {
                original_id,
                duplicate_content_hash: hash,
                similarity_score: score,
                dedup_type: kind.parse()?,
                created_at,
            })
        })
        .collect()
}

impl MemoryStore {
    pub async fn find_by_hash(&self, user_id: &str, hash: &str) -> MemoryResult<Option<MemoryId>> {
        let user_id = user_id.to_string();
        let hash = hash.to_string();
        self.pool
            .run("find_by_hash", move |conn| find_by_hash(conn, &user_id, &hash))
            .await
    }

    pub async fn record_duplicate_hit(&self, user_id: &str, record: DuplicateRecord) -> MemoryResult<()> {
        let user_id = user_id.to_string();
        self.pool
            .run("record_duplicate_hit", move |conn| record_hit_sync(conn, &user_id, &record))
            .await
    }

    pub async fn merge_into(&self, duplicate_id: &str, record: DuplicateRecord) -> MemoryResult<bool> {
        let duplicate_id = duplicate_id.to_string();
        self.pool
            .run("merge_duplicate", move |conn| merge_into_sync(conn, &duplicate_id, &record))
            .await
    }

    pub async fn duplicate_records(&self, original_id: &str) -> MemoryResult<Vec<DuplicateRecord>> {
        let original_id = original_id.to_string();
        self.pool
            .run("duplicate_records", move |conn| records_for(conn, &original_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{DedupType, MemoryCategory, MemoryStatus};
    use crate::engine::store::memories::{get_row, insert_row, soft_delete_sync};
    use crate::engine::store::test_support::{conn, memory};

    fn record(original: &str, hash: &str, kind: DedupType) -> DuplicateRecord {
        DuplicateRecord {
            original_id: original.into(),
            duplicate_content_hash: hash.into(),
            similarity_score: 0.97,
            dedup_type: kind,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn hash_lookup_is_user_scoped_and_active_only() {
        let mut c = conn();
        let m = memory("u1", "Ships from Austin", MemoryCategory::Facts);
        insert_row(&c, &m).unwrap();
        assert_eq!(find_by_hash(&c, "u1", &m.content_hash).unwrap(), Some(m.id.clone()));
        assert_eq!(find_by_hash(&c, "u2", &m.content_hash).unwrap(), None);
        soft_delete_sync(&mut c, &m.id, "u1").unwrap();
        assert_eq!(find_by_hash(&c, "u1", &m.content_hash).unwrap(), None);
    }

    #[test]
    fn hash_lookup_follows_duplicate_records() {
        let mut c = conn();
        let m = memory("u1", "Ships from Austin", MemoryCategory::Facts);
        insert_row(&c, &m).unwrap();
        record_hit_sync(&mut c, "u1", &record(&m.id, "h-variant", DedupType::Fuzzy)).unwrap();
        assert_eq!(find_by_hash(&c, "u1", "h-variant").unwrap(), Some(m.id.clone()));
    }

    #[test]
    fn hit_bumps_access_and_appends_record() {
        let mut c = conn();
        let m = memory("u1", "x", MemoryCategory::General);
        insert_row(&c, &m).unwrap();
        record_hit_sync(&mut c, "u1", &record(&m.id, "h1", DedupType::Exact)).unwrap();
        record_hit_sync(&mut c, "u1", &record(&m.id, "h2", DedupType::Semantic)).unwrap();
        let back = get_row(&c, &m.id).unwrap().unwrap();
        assert_eq!(back.access_count, 2);
        let recs = records_for(&c, &m.id).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].dedup_type, DedupType::Semantic);
    }

    #[test]
    fn hit_on_inactive_original_is_not_found() {
        let mut c = conn();
        let m = memory("u1", "x", MemoryCategory::General);
        insert_row(&c, &m).unwrap();
        soft_delete_sync(&mut c, &m.id, "u1").unwrap();
        let err = record_hit_sync(&mut c, "u1", &record(&m.id, "h", DedupType::Exact)).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
        assert!(records_for(&c, &m.id).unwrap().is_empty());
    }

    #[test]
    fn merge_retires_duplicate_and_repoints_records() {
        let mut c = conn();
        let keep = memory("u1", "keep", MemoryCategory::General);
        let dup = memory("u1", "dup", MemoryCategory::General);
        insert_row(&c, &keep).unwrap();
        insert_row(&c, &dup).unwrap();
        record_hit_sync(&mut c, "u1", &record(&dup.id, "older", DedupType::Exact)).unwrap();

        assert!(merge_into_sync(&mut c, &dup.id, &record(&keep.id, &dup.content_hash, DedupType::Fuzzy)).unwrap());
        assert!(!merge_into_sync(&mut c, &dup.id, &record(&keep.id, &dup.content_hash, DedupType::Fuzzy)).unwrap());

        assert_eq!(get_row(&c, &dup.id).unwrap().unwrap().status, MemoryStatus::Deduplicated);
        assert_eq!(records_for(&c, &keep.id).unwrap().len(), 2);
        assert_eq!(find_by_hash(&c, "u1", "older").unwrap(), Some(keep.id.clone()));
    }
}
