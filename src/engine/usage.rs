// ── Merchant Memory: Usage Tracking ────────────────────────────────────────
//
// After a turn, every memory that was injected into the prompt is checked
// against the generated response. Used memories gain usefulness, unused ones
// lose a little. Updates run on a bounded worker queue so the response path
// never waits on them; a full queue is reported, not absorbed.

use crate::atoms::constants::{USAGE_KEYWORD_MIN_LEN, USAGE_MIN_SHARED_KEYWORDS};
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::{Memory, MemoryCategory};
use crate::engine::config::{DecayConfig, UsageConfig};
use crate::engine::store::{AnalyticsEvent, MemoryStore};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

// ═══════════════════════════════════════════════════════════════════════════
// Detection
// ═══════════════════════════════════════════════════════════════════════════

/// Phrases that show a response leaned on a memory of that category.
static CATEGORY_PATTERNS: LazyLock<HashMap<MemoryCategory, Vec<Regex>>> = LazyLock::new(|| {
    let table: [(MemoryCategory, &[&str]); 7] = [
        (
            MemoryCategory::Preferences,
            &[
                r"(?i)\bas you prefer\b",
                r"(?i)\byou (like|prefer|love|enjoy)\b",
                r"(?i)\byour (preference|preferred|favorite|favourite)\b",
            ],
        ),
        (
            MemoryCategory::Facts,
            &[
                r"(?i)\b(as you mentioned|you mentioned|you said|you told me)\b",
                r"(?i)\bbased on what you('ve| have)? (told|shared)\b",
            ],
        ),
        (
            MemoryCategory::Problems,
            &[
                r"(?i)\b(the|your) (issue|problem|error|trouble) (you|with)\b",
                r"(?i)\bsince you('re| are) (having|facing|seeing)\b",
            ],
        ),
        (
            MemoryCategory::Solutions,
            &[
                r"(?i)\b(last time|previously|before),? (we|you) (fixed|solved|resolved)\b",
                r"(?i)\b(the|that) (fix|workaround|solution) (that )?(worked|you used)\b",
            ],
        ),
        (
            MemoryCategory::Relationships,
            &[r"(?i)\byour (supplier|vendor|partner|team|manager|customer|client|accountant)s?\b"],
        ),
        (
            MemoryCategory::Expertise,
            &[
                r"(?i)\bsince you('re| are) (familiar|experienced|an expert)\b",
                r"(?i)\bgiven your (experience|background|expertise)\b",
            ],
        ),
        (
            MemoryCategory::Interactions,
            &[r"(?i)\b(last time we (spoke|talked|chatted)|in our (last|previous) (conversation|chat))\b"],
        ),
    ];
    table
        .into_iter()
        .map(|(cat, patterns)| {
            let compiled = patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();
            (cat, compiled)
        })
        .collect()
});

/// Distinct lower-cased words strictly longer than the keyword floor.
pub fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > USAGE_KEYWORD_MIN_LEN)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Did `response` make use of `memory`?
pub fn memory_was_used(memory: &Memory, response: &str) -> bool {
    let response_words = keywords(response);
    let shared = keywords(&memory.content)
        .iter()
        .filter(|k| response_words.contains(*k))
        .count();
    if shared >= USAGE_MIN_SHARED_KEYWORDS {
        return true;
    }
    CATEGORY_PATTERNS
        .get(&memory.category)
        .is_some_and(|patterns| patterns.iter().any(|re| re.is_match(response)))
}

// ═══════════════════════════════════════════════════════════════════════════
// Applying usage
// ═══════════════════════════════════════════════════════════════════════════

/// One finished turn: the memories injected and what the agent said.
#[derive(Debug, Clone)]
pub struct UsageReport {
    pub user_id: String,
    pub memories: Vec<Memory>,
    pub response: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageOutcome {
    pub used: usize,
    pub unused: usize,
    pub failed: usize,
}

/// Score every memory in the report. Per-row failures are logged and
/// counted, never returned.
pub async fn apply_usage(store: &MemoryStore, decay: &DecayConfig, report: &UsageReport) -> UsageOutcome {
    let mut outcome = UsageOutcome::default();
    for memory in &report.memories {
        let used = memory_was_used(memory, &report.response);
        let delta = if used { decay.used_boost } else { -decay.unused_penalty };
        match store.adjust_usefulness(&memory.id, delta).await {
            Ok(Some(score)) => {
                debug!("[usage] {} {} → usefulness {:.2}", memory.id, if used { "used" } else { "unused" }, score);
                if used {
                    outcome.used += 1;
                } else {
                    outcome.unused += 1;
                }
            }
            Ok(None) => debug!("[usage] {} no longer active, skipped", memory.id),
            Err(e) => {
                outcome.failed += 1;
                error!("[usage] Failed to update {}: {}", memory.id, e);
            }
        }
    }
    store
        .record_event(
            AnalyticsEvent::Usage,
            Some(&report.user_id),
            None,
            serde_json::to_value(outcome).ok(),
        )
        .await;
    outcome
}

// ═══════════════════════════════════════════════════════════════════════════
// Bounded worker queue
// ═══════════════════════════════════════════════════════════════════════════

pub struct UsageQueue {
    tx: Mutex<Option<mpsc::Sender<UsageReport>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl UsageQueue {
    /// Spawn the workers on the current runtime.
    pub fn start(store: MemoryStore, decay: DecayConfig, config: &UsageConfig) -> Self {
        let (tx, rx) = mpsc::channel::<UsageReport>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let decay = Arc::new(decay);
        let workers = (0..config.workers.max(1))
            .map(|n| {
                let rx = Arc::clone(&rx);
                let store = store.clone();
                let decay = Arc::clone(&decay);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(report) = next else { break };
                        let outcome = apply_usage(&store, &decay, &report).await;
                        debug!(
                            "[usage] worker {} scored {} memories for {} ({} used)",
                            n,
                            report.memories.len(),
                            report.user_id,
                            outcome.used
                        );
                    }
                    debug!("[usage] worker {} stopped", n);
                })
            })
            .collect();
        info!(
            "[usage] Queue started ({} workers, capacity {})",
            config.workers.max(1),
            config.queue_capacity.max(1)
        );
        UsageQueue {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue without waiting. A full queue is `QueueFull`.
    pub fn submit(&self, report: UsageReport) -> MemoryResult<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(MemoryError::storage_unavailable("track_usage", 0, "usage queue is shut down"));
        };
        match tx.try_send(report) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(report)) => {
                warn!("[usage] Queue full, dropping report for {}", report.user_id);
                Err(MemoryError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(MemoryError::storage_unavailable(
                "track_usage",
                0,
                "usage workers have stopped",
            )),
        }
    }

    /// Stop accepting work, let the workers drain what is queued, and wait
    /// for them to exit.
    pub async fn shutdown(&self) {
        let sender = self.tx.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("[usage] Worker ended abnormally: {}", e);
            }
        }
        info!("[usage] Queue drained and stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::MemoryCandidate;
    use chrono::Utc;

    fn mem(content: &str, category: MemoryCategory) -> Memory {
        Memory::from_candidate(MemoryCandidate::new("u1", content, category), "h".into(), None, Utc::now())
    }

    #[test]
    fn shared_keywords_count_as_use() {
        let m = mem("Ships orders through Shopify with FedEx Ground", MemoryCategory::Facts);
        assert!(memory_was_used(&m, "I'll create the Shopify label for FedEx pickup."));
        assert!(!memory_was_used(&m, "I'll create a label for pickup."));
    }

    #[test]
    fn short_words_are_not_keywords() {
        let k = keywords("Uses UPS and USPS for small boxes");
        assert!(k.contains("small"));
        assert!(k.contains("boxes"));
        assert!(!k.contains("usps"));
        assert!(!k.contains("uses"));
    }

    #[test]
    fn category_phrases_count_as_use() {
        let pref = mem("Likes weekly summaries", MemoryCategory::Preferences);
        assert!(memory_was_used(&pref, "As you prefer, here is the recap."));
        assert!(memory_was_used(&pref, "Since you LIKE brevity: sales are up."));

        let rel = mem("Works with Acme as main vendor", MemoryCategory::Relationships);
        assert!(memory_was_used(&rel, "I emailed your supplier about the delay."));

        let general = mem("Opened store in 2019", MemoryCategory::General);
        assert!(!memory_was_used(&general, "As you prefer, here is the recap."));
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure() {
        use crate::engine::config::DatabaseConfig;
        use crate::engine::pool::ConnectionPool;

        let mut db = DatabaseConfig::in_memory();
        db.concurrency_limit = 1;
        let pool = Arc::new(ConnectionPool::open(&db).unwrap());
        let store = MemoryStore::open(Arc::clone(&pool)).await.unwrap();
        let queue = UsageQueue::start(
            store,
            DecayConfig::default(),
            &UsageConfig { queue_capacity: 1, workers: 1 },
        );
        let report = || UsageReport {
            user_id: "u1".into(),
            memories: vec![mem("Ships with FedEx", MemoryCategory::Facts)],
            response: "Booked the pickup.".into(),
        };

        // The worker parks on its first report while the only permit is held.
        let held = pool.acquire().await.unwrap();
        queue.submit(report()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        queue.submit(report()).unwrap();
        assert!(matches!(queue.submit(report()), Err(MemoryError::QueueFull)));

        drop(held);
        queue.shutdown().await;
        assert!(matches!(queue.submit(report()), Err(MemoryError::StorageUnavailable { .. })));
    }

    #[test]
    fn every_category_pattern_compiles() {
        for (cat, patterns) in CATEGORY_PATTERNS.iter() {
            assert!(!patterns.is_empty(), "{} has no usable patterns", cat);
        }
        assert_eq!(CATEGORY_PATTERNS.len(), 7);
    }
}
