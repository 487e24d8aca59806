// ── Merchant Memory Atoms: Collaborator Traits ─────────────────────────────
//
// The memory core talks to two external services through these seams:
//   • Embedder      text → vector (Ollama / OpenAI-compatible in practice)
//   • Consolidator  shrinks over-budget prompt context (an LLM in practice)
//
// Adding a backend never requires touching the engine, just implement the
// trait and hand it to `MemoryService::init`.

use crate::atoms::error::MemoryResult;
use crate::atoms::types::{PromptFragment, SearchResult};
use async_trait::async_trait;

/// One embedding call's result.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub token_count: usize,
    pub from_cache: bool,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Must return `MemoryError::EmbeddingUnavailable` when the backend is
    /// down, so callers can degrade instead of failing.
    async fn embed(&self, text: &str) -> MemoryResult<Embedding>;
}

/// What a consolidator hands back: a subset (or rewrite) of its inputs that
/// fits the budget, plus a short note for logs.
#[derive(Debug, Clone, Default)]
pub struct Consolidated {
    pub memories: Vec<SearchResult>,
    pub fragments: Vec<PromptFragment>,
    pub note: String,
}

#[async_trait]
pub trait Consolidator: Send + Sync {
    fn name(&self) -> &str;

    async fn consolidate(
        &self,
        memories: &[SearchResult],
        fragments: &[PromptFragment],
        query: &str,
        token_budget: usize,
    ) -> MemoryResult<Consolidated>;
}
