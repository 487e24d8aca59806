// ── Merchant Memory: Service ───────────────────────────────────────────────
//
// The one object the agent backend holds. `init` wires the pool, store,
// deduplicator, decay tracker, usage queue and assembler together; `close`
// drains background work and shuts the pool. Nothing here is global: two
// services with two configs can live in one process.

use crate::atoms::constants::{DEFAULT_BACKFILL_BATCH, DEFAULT_SEARCH_THRESHOLD};
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::traits::{Consolidator, Embedder};
use crate::atoms::types::{
    ContextTier, Memory, MemoryCandidate, MemoryCategory, MemoryId, MemoryStats, PromptFragment,
    SearchResult, StoreOutcome,
};
use crate::engine::assembler::{AssembledPrompt, Assembler};
use crate::engine::config::MemoryConfig;
use crate::engine::consolidation::LlmConsolidator;
use crate::engine::decay::DecayTracker;
use crate::engine::dedup::{content_hash, normalize_content, Deduplicator};
use crate::engine::embedding::HttpEmbedder;
use crate::engine::pool::{ConnectionPool, PoolStatus};
use crate::engine::retrieval::Retriever;
use crate::engine::store::MemoryStore;
use crate::engine::usage::{UsageQueue, UsageReport};
use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct MemoryService {
    config: MemoryConfig,
    pool: Arc<ConnectionPool>,
    store: MemoryStore,
    retriever: Retriever,
    dedup: Deduplicator,
    decay: DecayTracker,
    usage: UsageQueue,
    assembler: Assembler,
    stop_signal: Arc<AtomicBool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryService {
    /// Open storage and start background workers. Explicit collaborators
    /// win; otherwise the HTTP ones are built when enabled in config.
    pub async fn init(
        config: MemoryConfig,
        embedder: Option<Arc<dyn Embedder>>,
        consolidator: Option<Arc<dyn Consolidator>>,
    ) -> MemoryResult<Self> {
        config.validate()?;

        let db = config.database.clone();
        let pool = tokio::task::spawn_blocking(move || ConnectionPool::open(&db))
            .await
            .map_err(|e| MemoryError::Other(format!("pool open task failed: {}", e)))??;
        let pool = Arc::new(pool);
        let store = MemoryStore::open(Arc::clone(&pool)).await?;

        let embedder = embedder.or_else(|| {
            config
                .embedding
                .enabled
                .then(|| Arc::new(HttpEmbedder::new(&config.embedding)) as Arc<dyn Embedder>)
        });
        let consolidator = consolidator.or_else(|| {
            config
                .consolidation
                .enabled
                .then(|| Arc::new(LlmConsolidator::new(&config.consolidation)) as Arc<dyn Consolidator>)
        });
        if embedder.is_none() {
            warn!("[memory] No embedder, search runs in text-match mode and the semantic dedup layer is off");
        }

        let retriever = Retriever::new(store.clone(), embedder);
        let dedup = Deduplicator::new(store.clone(), config.dedup.clone());
        let decay = DecayTracker::new(store.clone(), config.decay.clone());
        let usage = UsageQueue::start(store.clone(), config.decay.clone(), &config.usage);
        let assembler = Assembler::new(
            retriever.clone(),
            store.clone(),
            consolidator,
            config.prompts.clone(),
            config.tiers.clone(),
        );

        info!("[memory] Service ready (database {})", config.database.path);
        Ok(MemoryService {
            config,
            pool,
            store,
            retriever,
            dedup,
            decay,
            usage,
            assembler,
            stop_signal: Arc::new(AtomicBool::new(false)),
            maintenance: Mutex::new(None),
        })
    }

    /// Stop maintenance, drain the usage queue, shut the pool.
    pub async fn close(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        self.usage.shutdown().await;
        self.pool.close();
        info!("[memory] Service closed");
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    // ── Writing ────────────────────────────────────────────────────────────

    pub async fn store_memory(
        &self,
        user_id: &str,
        content: &str,
        category: MemoryCategory,
        importance: f64,
        metadata: serde_json::Value,
    ) -> MemoryResult<MemoryId> {
        let candidate = MemoryCandidate::new(user_id, content, category)
            .with_importance(importance)
            .with_metadata(metadata);
        Ok(self.store_candidate(candidate).await?.into_id())
    }

    /// Validate, normalize, embed, dedup, insert.
    pub async fn store_candidate(&self, mut candidate: MemoryCandidate) -> MemoryResult<StoreOutcome> {
        candidate.validate()?;
        candidate.content = normalize_content(&candidate.content);

        let embedding = self.retriever.try_embed(&candidate.content).await;
        if let Some(hit) = self
            .dedup
            .find_duplicate(&candidate.user_id, &candidate.content, candidate.category, embedding.as_deref())
            .await?
        {
            return Ok(StoreOutcome::Duplicate {
                id: hit.original_id,
                dedup_type: hit.dedup_type,
                similarity: hit.similarity,
            });
        }

        let hash = content_hash(&candidate.content);
        let memory = Memory::from_candidate(candidate, hash, embedding, Utc::now());
        let id = self.store.insert(memory).await?;
        Ok(StoreOutcome::Inserted { id })
    }

    /// Importance update. An unknown id is `false`, not an error.
    pub async fn update_memory_importance(&self, id: &str, score: f64) -> MemoryResult<bool> {
        match self.store.update_importance(id, score).await {
            Ok(_) => Ok(true),
            Err(MemoryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_memory(&self, id: &str, user_id: &str) -> MemoryResult<bool> {
        let deleted = self.store.delete(id, user_id).await?;
        if !deleted {
            info!("[memory] Delete of {} for {} matched nothing", id, user_id);
        }
        Ok(deleted)
    }

    pub async fn verify_memory(&self, id: &str) -> MemoryResult<bool> {
        self.decay.verify(id).await
    }

    // ── Reading ────────────────────────────────────────────────────────────

    pub async fn search_memories(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        category: Option<MemoryCategory>,
        threshold: Option<f64>,
    ) -> MemoryResult<Vec<SearchResult>> {
        self.retriever
            .search(user_id, query, limit, category, threshold.unwrap_or(DEFAULT_SEARCH_THRESHOLD))
            .await
    }

    pub async fn get_by_category(
        &self,
        user_id: &str,
        category: MemoryCategory,
        limit: usize,
    ) -> MemoryResult<Vec<Memory>> {
        self.store.get_by_category(user_id, category, limit).await
    }

    pub async fn get_memory(&self, id: &str) -> MemoryResult<Option<Memory>> {
        self.store.get(id).await
    }

    pub async fn get_user_memory_stats(&self, user_id: &str) -> MemoryResult<MemoryStats> {
        if user_id.trim().is_empty() {
            return Err(MemoryError::validation("user_id must not be empty"));
        }
        self.store.stats(user_id).await
    }

    pub async fn assemble_prompt(
        &self,
        query: &str,
        user_id: &str,
        agent_type: &str,
        tier: ContextTier,
    ) -> MemoryResult<AssembledPrompt> {
        self.assembler.assemble(query, user_id, agent_type, tier).await
    }

    // ── Usage & maintenance ────────────────────────────────────────────────

    /// Queue usage scoring for a finished turn. Returns immediately.
    pub fn track_usage(&self, report: UsageReport) -> MemoryResult<()> {
        if report.memories.is_empty() {
            return Ok(());
        }
        self.usage.submit(report)
    }

    pub async fn archive_sweep(&self, threshold: f64) -> MemoryResult<usize> {
        self.decay.archive_sweep(threshold).await
    }

    pub async fn dedup_sweep(&self, user_id: &str) -> MemoryResult<usize> {
        self.dedup.dedup_sweep(user_id).await
    }

    /// Embed rows stored while the embedder was down.
    /// Returns (embedded, failed).
    pub async fn backfill_embeddings(&self, limit: Option<usize>) -> MemoryResult<(usize, usize)> {
        if !self.retriever.has_embedder() {
            return Err(MemoryError::EmbeddingUnavailable("no embedder configured".into()));
        }
        let pending = self
            .store
            .list_without_embeddings(limit.unwrap_or(DEFAULT_BACKFILL_BATCH))
            .await?;
        if pending.is_empty() {
            info!("[memory] Backfill: all memories already have embeddings");
            return Ok((0, 0));
        }

        info!("[memory] Backfill: embedding {} memories...", pending.len());
        let (mut success, mut fail) = (0usize, 0usize);
        for (id, content) in &pending {
            match self.retriever.embed(content).await {
                Ok(vector) => match self.store.set_embedding(id, vector).await {
                    Ok(_) => success += 1,
                    Err(e) => {
                        warn!("[memory] Backfill: failed to update {}: {}", id, e);
                        fail += 1;
                    }
                },
                Err(e) => {
                    warn!("[memory] Backfill: embed failed for {}: {}", id, e);
                    fail += 1;
                }
            }
        }
        info!("[memory] Backfill complete: {} succeeded, {} failed", success, fail);
        Ok((success, fail))
    }

    /// Delete analytics events past `decay.analytics_retention_days`.
    pub async fn prune_analytics(&self) -> MemoryResult<usize> {
        self.store.prune_events(self.config.decay.analytics_retention_days).await
    }

    /// Run `archive_sweep` and the analytics prune every
    /// `decay.sweep_interval_secs` until `close`.
    /// Calling it twice keeps the first task.
    pub fn spawn_maintenance(&self) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let tracker = DecayTracker::new(self.store.clone(), self.config.decay.clone());
        let store = self.store.clone();
        let threshold = self.config.decay.archive_threshold;
        let retention_days = self.config.decay.analytics_retention_days;
        let period = Duration::from_secs(self.config.decay.sweep_interval_secs.max(1));
        let stop = Arc::clone(&self.stop_signal);

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = tracker.archive_sweep(threshold).await {
                    error!("[decay] Scheduled archive sweep failed: {}", e);
                }
                if let Err(e) = store.prune_events(retention_days).await {
                    error!("[memory] Scheduled analytics prune failed: {}", e);
                }
            }
        }));
        info!("[memory] Maintenance scheduled every {:?}", period);
    }

    // ── Prompt fragments ───────────────────────────────────────────────────

    pub async fn add_fragment(&self, fragment: PromptFragment) -> MemoryResult<String> {
        self.store.upsert_fragment(fragment).await
    }

    pub async fn list_fragments(&self, include_inactive: bool) -> MemoryResult<Vec<PromptFragment>> {
        self.store.list_fragments(include_inactive).await
    }

    pub async fn set_fragment_active(&self, id: &str, active: bool) -> MemoryResult<bool> {
        self.store.set_fragment_active(id, active).await
    }
}
