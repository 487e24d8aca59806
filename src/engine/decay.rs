// ── Merchant Memory: Decay & Archival ──────────────────────────────────────
//
// Effective importance is computed on read, never stored:
//
//   rate      = decay_rate × (4 if ephemeral)
//   base      = importance × e^(−rate × age_days)
//   boost     = (1 + 0.1·ln(1 + access_count)) × (0.5 + usefulness)
//   effective = clamp(base × boost, 0, 1)
//
// Neutral usefulness (0.5) and zero accesses make boost exactly 1.
// The archive sweep moves rows that decayed (or went stale) out of `active`.

use crate::atoms::constants::{
    ACCESS_BOOST_WEIGHT, EPHEMERAL_DECAY_MULTIPLIER, VERIFIED_DECAY_MULTIPLIER,
    VERIFIED_IMPORTANCE_MULTIPLIER, VERIFIED_USEFULNESS_BONUS,
};
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::{Memory, MemoryStatus};
use crate::engine::config::DecayConfig;
use crate::engine::store::{AnalyticsEvent, MemoryStore};
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::Serialize;

const SECS_PER_DAY: f64 = 86_400.0;

/// Whole and fractional days from `from` to `to`, floored at zero.
pub fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0 / SECS_PER_DAY).max(0.0)
}

pub fn effective_importance(memory: &Memory, now: DateTime<Utc>) -> f64 {
    let rate = if memory.is_ephemeral {
        memory.decay_rate * EPHEMERAL_DECAY_MULTIPLIER
    } else {
        memory.decay_rate
    };
    let age_days = days_between(memory.created_at, now);
    let base = memory.importance_score * (-rate * age_days).exp();
    let access = memory.access_count.max(0) as f64;
    let boost = (1.0 + ACCESS_BOOST_WEIGHT * (1.0 + access).ln()) * (0.5 + memory.usefulness_score);
    (base * boost).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ArchiveReason {
    Decayed { effective: f64 },
    EphemeralExpired { age_days: f64 },
    Stale { idle_days: f64 },
}

/// Why `memory` should leave `active` at `now`, if it should.
pub fn archive_reason(memory: &Memory, now: DateTime<Utc>, threshold: f64, config: &DecayConfig) -> Option<ArchiveReason> {
    let effective = effective_importance(memory, now);
    if effective < threshold {
        return Some(ArchiveReason::Decayed { effective });
    }
    let age_days = days_between(memory.created_at, now);
    if memory.is_ephemeral && age_days > config.ephemeral_max_age_days as f64 {
        return Some(ArchiveReason::EphemeralExpired { age_days });
    }
    let idle_days = days_between(memory.last_touched(), now);
    if idle_days >= config.stale_after_days as f64 {
        return Some(ArchiveReason::Stale { idle_days });
    }
    None
}

pub struct DecayTracker {
    store: MemoryStore,
    config: DecayConfig,
}

impl DecayTracker {
    pub fn new(store: MemoryStore, config: DecayConfig) -> Self {
        DecayTracker { store, config }
    }

    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    /// Archive every active row that decayed below `threshold`, outlived the
    /// ephemeral window, or went unused for too long. Per-row failures are
    /// logged and skipped. Returns the number archived.
    pub async fn archive_sweep(&self, threshold: f64) -> MemoryResult<usize> {
        if threshold.is_nan() || !(0.0..=1.0).contains(&threshold) {
            return Err(MemoryError::validation(format!("archive threshold must be within [0, 1], got {}", threshold)));
        }
        let now = Utc::now();
        let batch = self.config.sweep_batch_size.max(1);
        let mut cursor = String::new();
        let (mut scanned, mut archived, mut failed) = (0usize, 0usize, 0usize);

        loop {
            let page = self.store.active_page(&cursor, batch).await?;
            let Some(last) = page.last() else { break };
            cursor = last.id.clone();
            let page_len = page.len();
            scanned += page_len;

            for memory in &page {
                let Some(reason) = archive_reason(memory, now, threshold, &self.config) else {
                    continue;
                };
                match self.store.set_status(&memory.id, MemoryStatus::Archived).await {
                    Ok(true) => {
                        archived += 1;
                        debug!("[decay] Archived {} ({:?})", memory.id, reason);
                        self.store
                            .record_event(
                                AnalyticsEvent::Archive,
                                Some(&memory.user_id),
                                Some(&memory.id),
                                serde_json::to_value(reason).ok(),
                            )
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        failed += 1;
                        error!("[decay] Failed to archive {}: {}", memory.id, e);
                    }
                }
            }

            if page_len < batch {
                break;
            }
        }

        info!(
            "[decay] Archive sweep: scanned {}, archived {}, failed {} (threshold {:.2})",
            scanned, archived, failed, threshold
        );
        Ok(archived)
    }

    /// Mark a memory as verified: importance ×1.2 (capped), decay ×0.8,
    /// usefulness +0.2 (capped). A second call is a no-op returning false.
    pub async fn verify(&self, id: &str) -> MemoryResult<bool> {
        let changed = self
            .store
            .verify(
                id,
                VERIFIED_IMPORTANCE_MULTIPLIER,
                VERIFIED_DECAY_MULTIPLIER,
                VERIFIED_USEFULNESS_BONUS,
            )
            .await?;
        if changed {
            info!("[decay] Verified {}", id);
            self.store.record_event(AnalyticsEvent::Verify, None, Some(id), None).await;
        }
        Ok(changed)
    }
}
