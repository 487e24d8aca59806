// ── Merchant Memory: Prompt Assembler ──────────────────────────────────────
//
// Builds the memory-aware context for one agent turn, inside a token budget
// chosen by tier:
//
//   Gather  →  tier-scoped memory search ∥ eligible prompt fragments
//   Fit     →  over budget? consolidate (LLM) : keep; on failure truncate
//   Render  →  base prompt, fragments by category, top memories, hard cap
//
// The hard cap runs last. Whatever the earlier stages kept, the rendered
// text never exceeds budget × 4 characters.

use crate::atoms::constants::{MAX_FRAGMENTS, MAX_RENDERED_MEMORIES, TRUNCATION_KEEP};
use crate::atoms::error::MemoryResult;
use crate::atoms::traits::Consolidator;
use crate::atoms::types::{ContextTier, PromptFragment, SearchResult};
use crate::engine::config::{PromptConfig, TierSettings, TierTable};
use crate::engine::retrieval::Retriever;
use crate::engine::store::{AnalyticsEvent, MemoryStore};
use crate::engine::tokenizer::Tokenizer;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════
// Stage types
// ═══════════════════════════════════════════════════════════════════════════

/// Everything fetched for a turn, before any budgeting.
#[derive(Debug, Clone)]
pub struct Gathered {
    pub query: String,
    pub user_id: String,
    pub agent_type: String,
    pub tier: ContextTier,
    pub settings: TierSettings,
    pub base_prompt: String,
    pub memories: Vec<SearchResult>,
    pub fragments: Vec<PromptFragment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    NotNeeded,
    Consolidated { note: String },
    Truncated { reason: String },
}

/// What survived the budget pass.
#[derive(Debug, Clone)]
pub struct Fitted {
    pub gathered: Gathered,
    pub memories: Vec<SearchResult>,
    pub fragments: Vec<PromptFragment>,
    pub consolidation: ConsolidationOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledPrompt {
    pub text: String,
    pub tier: ContextTier,
    pub agent_type: String,
    /// Memories actually rendered, in relevance order.
    pub memories: Vec<SearchResult>,
    pub fragments: Vec<PromptFragment>,
    pub estimated_tokens: usize,
    pub budget_tokens: usize,
    pub consolidation: ConsolidationOutcome,
    pub hard_capped: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// Rendering
// ═══════════════════════════════════════════════════════════════════════════

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, word) in s.split(['_', '-', ' ']).filter(|w| !w.is_empty()).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Group fragments by category, groups ordered by their first (highest
/// priority) member, priority order kept inside each group.
fn group_fragments(fragments: &[PromptFragment]) -> Vec<(&str, Vec<&PromptFragment>)> {
    let mut groups: Vec<(&str, Vec<&PromptFragment>)> = Vec::new();
    for f in fragments {
        match groups.iter_mut().find(|(cat, _)| *cat == f.category.as_str()) {
            Some((_, members)) => members.push(f),
            None => groups.push((f.category.as_str(), vec![f])),
        }
    }
    for (_, members) in groups.iter_mut() {
        members.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
    groups
}

pub fn render(base_prompt: &str, fragments: &[PromptFragment], memories: &[SearchResult]) -> String {
    let mut out = base_prompt.trim().to_string();

    for (category, members) in group_fragments(fragments) {
        out.push_str(&format!("\n\n## {}\n", title_case(category)));
        for f in members {
            out.push_str(&format!("- {}\n", f.content.trim()));
        }
    }

    let shown = &memories[..memories.len().min(MAX_RENDERED_MEMORIES)];
    if !shown.is_empty() {
        out.push_str("\n\n## What you know about this merchant\n");
        for r in shown {
            out.push_str(&format!("- [{}] {}\n", r.memory.category, r.memory.content));
        }
    }
    out.trim_end().to_string()
}

/// Keep the most similar memories and highest-priority fragments.
fn truncate(memories: &[SearchResult], fragments: &[PromptFragment]) -> (Vec<SearchResult>, Vec<PromptFragment>) {
    let mut mems = memories.to_vec();
    mems.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
    mems.truncate(TRUNCATION_KEEP);
    let mut frags = fragments.to_vec();
    frags.sort_by(|a, b| b.priority.cmp(&a.priority));
    frags.truncate(TRUNCATION_KEEP);
    (mems, frags)
}

// ═══════════════════════════════════════════════════════════════════════════
// Assembler
// ═══════════════════════════════════════════════════════════════════════════

pub struct Assembler {
    retriever: Retriever,
    store: MemoryStore,
    consolidator: Option<Arc<dyn Consolidator>>,
    prompts: PromptConfig,
    tiers: TierTable,
    tokenizer: Tokenizer,
}

impl Assembler {
    pub fn new(
        retriever: Retriever,
        store: MemoryStore,
        consolidator: Option<Arc<dyn Consolidator>>,
        prompts: PromptConfig,
        tiers: TierTable,
    ) -> Self {
        Assembler {
            retriever,
            store,
            consolidator,
            prompts,
            tiers,
            tokenizer: Tokenizer::default(),
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub async fn assemble(
        &self,
        query: &str,
        user_id: &str,
        agent_type: &str,
        tier: ContextTier,
    ) -> MemoryResult<AssembledPrompt> {
        let gathered = self.gather(query, user_id, agent_type, tier).await?;
        let fitted = self.fit(gathered).await;
        let prompt = self.render_fitted(fitted);

        info!(
            "[assembler] {} / {} tier: {} memories, {} fragments, ~{}/{} tokens{}",
            prompt.agent_type,
            prompt.tier,
            prompt.memories.len(),
            prompt.fragments.len(),
            prompt.estimated_tokens,
            prompt.budget_tokens,
            if prompt.hard_capped { " (hard-capped)" } else { "" }
        );
        self.store
            .record_event(
                AnalyticsEvent::Assemble,
                Some(user_id),
                None,
                Some(json!({
                    "tier": prompt.tier.as_str(),
                    "agent_type": prompt.agent_type,
                    "tokens": prompt.estimated_tokens,
                    "budget": prompt.budget_tokens,
                    "consolidation": prompt.consolidation,
                    "hard_capped": prompt.hard_capped,
                })),
            )
            .await;
        Ok(prompt)
    }

    /// Search and fragment lookup run concurrently.
    pub async fn gather(
        &self,
        query: &str,
        user_id: &str,
        agent_type: &str,
        tier: ContextTier,
    ) -> MemoryResult<Gathered> {
        let settings = self.tiers.get(tier);
        let (memories, fragments) = tokio::join!(
            self.retriever.search(
                user_id,
                query,
                settings.memory_limit,
                None,
                settings.similarity_threshold
            ),
            self.store.fragments_for(Some(agent_type), tier, MAX_FRAGMENTS),
        );
        Ok(Gathered {
            query: query.to_string(),
            user_id: user_id.to_string(),
            agent_type: agent_type.to_string(),
            tier,
            settings,
            base_prompt: self.prompts.base_prompt_for(agent_type).to_string(),
            memories: memories?,
            fragments: fragments?,
        })
    }

    pub async fn fit(&self, gathered: Gathered) -> Fitted {
        let budget = gathered.settings.budget_tokens;
        let estimate = self
            .tokenizer
            .count_tokens(&render(&gathered.base_prompt, &gathered.fragments, &gathered.memories));
        if estimate <= budget {
            return Fitted {
                memories: gathered.memories.clone(),
                fragments: gathered.fragments.clone(),
                consolidation: ConsolidationOutcome::NotNeeded,
                gathered,
            };
        }
        debug!("[assembler] ~{} tokens over a {} budget", estimate, budget);

        let reason = match &self.consolidator {
            Some(consolidator) => {
                let remaining = budget.saturating_sub(self.tokenizer.count_tokens(&gathered.base_prompt));
                match consolidator
                    .consolidate(&gathered.memories, &gathered.fragments, &gathered.query, remaining)
                    .await
                {
                    Ok(out) => {
                        return Fitted {
                            memories: out.memories,
                            fragments: out.fragments,
                            consolidation: ConsolidationOutcome::Consolidated { note: out.note },
                            gathered,
                        };
                    }
                    Err(e) => {
                        warn!("[assembler] Consolidation via {} failed, truncating: {}", consolidator.name(), e);
                        e.to_string()
                    }
                }
            }
            None => "no consolidator configured".to_string(),
        };

        let (memories, fragments) = truncate(&gathered.memories, &gathered.fragments);
        Fitted {
            memories,
            fragments,
            consolidation: ConsolidationOutcome::Truncated { reason },
            gathered,
        }
    }

    pub fn render_fitted(&self, fitted: Fitted) -> AssembledPrompt {
        let budget = fitted.gathered.settings.budget_tokens;
        let mut memories = fitted.memories;
        memories.truncate(MAX_RENDERED_MEMORIES);
        let full = render(&fitted.gathered.base_prompt, &fitted.fragments, &memories);

        let max_chars = self.tokenizer.chars_for_tokens(budget);
        let (text, hard_capped) = if full.chars().count() > max_chars {
            let (cut, _) = self.tokenizer.truncate_to_budget(&full, budget);
            (cut.to_string(), true)
        } else {
            (full, false)
        };

        AssembledPrompt {
            estimated_tokens: self.tokenizer.count_tokens(&text),
            text,
            tier: fitted.gathered.tier,
            agent_type: fitted.gathered.agent_type,
            memories,
            fragments: fitted.fragments,
            budget_tokens: budget,
            consolidation: fitted.consolidation,
            hard_capped,
        }
    }
}
