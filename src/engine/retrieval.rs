// ── Merchant Memory: Retrieval ─────────────────────────────────────────────
//
// Query-side search. Embeds the query and ranks by cosine similarity; when
// the embedder is missing or down, falls back to substring search.
// Degraded searches are logged and counted.

use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::traits::Embedder;
use crate::atoms::types::{check_unit_interval, MemoryCategory, SearchResult};
use crate::engine::store::{AnalyticsEvent, MemoryStore};
use log::{debug, warn};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct Retriever {
    store: MemoryStore,
    embedder: Option<Arc<dyn Embedder>>,
}

impl Retriever {
    pub fn new(store: MemoryStore, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Retriever { store, embedder }
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    /// Embed `text`, or explain why not.
    pub async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let Some(embedder) = &self.embedder else {
            return Err(MemoryError::EmbeddingUnavailable("no embedder configured".into()));
        };
        let embedding = embedder.embed(text).await?;
        if embedding.vector.is_empty() {
            return Err(MemoryError::EmbeddingUnavailable(format!("{} returned an empty vector", embedder.name())));
        }
        Ok(embedding.vector)
    }

    /// Best-effort embedding: failures are logged and become `None`.
    pub async fn try_embed(&self, text: &str) -> Option<Vec<f32>> {
        match self.embed(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                if self.embedder.is_some() {
                    warn!("[memory] Embedding failed, continuing without: {}", e);
                }
                None
            }
        }
    }

    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        category: Option<MemoryCategory>,
        threshold: f64,
    ) -> MemoryResult<Vec<SearchResult>> {
        check_unit_interval("similarity threshold", threshold)?;
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        match self.embed(query).await {
            Ok(vector) => {
                let results = self
                    .store
                    .search_by_embedding(user_id, vector, limit, category, threshold)
                    .await?;
                debug!("[memory] Vector search for {} → {} results", user_id, results.len());
                self.store
                    .record_event(
                        AnalyticsEvent::Search,
                        Some(user_id),
                        None,
                        Some(json!({ "mode": "vector", "results": results.len() })),
                    )
                    .await;
                Ok(results)
            }
            Err(e) => {
                warn!("[memory] Search degraded to text match for {}: {}", user_id, e);
                let results = self.store.search_text(user_id, query, limit, category).await?;
                self.store
                    .record_event(
                        AnalyticsEvent::SearchDegraded,
                        Some(user_id),
                        None,
                        Some(json!({ "reason": e.to_string(), "results": results.len() })),
                    )
                    .await;
                Ok(results)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::traits::Embedding;
    use crate::atoms::types::{Memory, MemoryCandidate};
    use crate::engine::config::DatabaseConfig;
    use crate::engine::dedup::content_hash;
    use crate::engine::pool::ConnectionPool;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Down;

    #[async_trait]
    impl Embedder for Down {
        fn name(&self) -> &str {
            "down"
        }
        async fn embed(&self, _text: &str) -> MemoryResult<Embedding> {
            Err(MemoryError::EmbeddingUnavailable("connection refused".into()))
        }
    }

    struct Fixed(Vec<f32>);

    #[async_trait]
    impl Embedder for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn embed(&self, _text: &str) -> MemoryResult<Embedding> {
            Ok(Embedding { vector: self.0.clone(), token_count: 1, from_cache: false })
        }
    }

    async fn store() -> MemoryStore {
        let pool = ConnectionPool::open(&DatabaseConfig::in_memory()).unwrap();
        MemoryStore::open(Arc::new(pool)).await.unwrap()
    }

    async fn seed(store: &MemoryStore, content: &str, embedding: Option<Vec<f32>>) -> String {
        let memory = Memory::from_candidate(
            MemoryCandidate::new("u1", content, MemoryCategory::Facts),
            content_hash(content),
            embedding,
            Utc::now(),
        );
        store.insert(memory).await.unwrap()
    }

    #[tokio::test]
    async fn falls_back_to_text_when_embedder_is_down() {
        let store = store().await;
        seed(&store, "Sells handmade candles on Etsy", None).await;
        let r = Retriever::new(store.clone(), Some(Arc::new(Down)));
        let results = r.search("u1", "candles", 5, None, 0.25).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].similarity_score, 1.0);
        let events = store.event_counts("u1").await.unwrap();
        assert!(events.iter().any(|(e, n)| e == "search_degraded" && *n == 1));
    }

    #[tokio::test]
    async fn vector_search_when_embedder_is_up() {
        let store = store().await;
        let near = seed(&store, "Ships with FedEx", Some(vec![1.0, 0.0])).await;
        seed(&store, "Opened in 2019", Some(vec![0.0, 1.0])).await;
        let r = Retriever::new(store.clone(), Some(Arc::new(Fixed(vec![1.0, 0.1]))));
        let results = r.search("u1", "shipping", 5, None, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.id, near);
        assert_eq!(results[0].memory.access_count, 1);
    }

    #[tokio::test]
    async fn rejects_bad_threshold_and_ignores_empty_query() {
        let r = Retriever::new(store().await, None);
        assert!(matches!(
            r.search("u1", "x", 5, None, 1.5).await,
            Err(MemoryError::Validation(_))
        ));
        assert!(r.search("u1", "   ", 5, None, 0.2).await.unwrap().is_empty());
    }
}
