// ── Merchant Memory: LLM Consolidation ─────────────────────────────────────
//
// Reference `Consolidator` that asks an OpenAI-compatible chat model which
// memories and fragments to keep when assembled context runs over budget.
// The model answers with JSON naming the ids to keep plus a one-line note
// summarising what was dropped. Anything unusable is `ConsolidationFailed`,
// which the assembler answers by truncating.

use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::traits::{Consolidated, Consolidator};
use crate::atoms::types::{PromptFragment, SearchResult};
use crate::engine::config::ConsolidationConfig;
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You trim context for an e-commerce assistant. \
You receive numbered memories and instruction fragments plus the user's query and a token budget. \
Keep the items most relevant to the query that fit the budget. \
Reply with JSON only: {\"memory_ids\": [..], \"fragment_ids\": [..], \"note\": \"one sentence on what was dropped\"}.";

#[derive(Debug, Deserialize)]
struct Selection {
    #[serde(default)]
    memory_ids: Vec<String>,
    #[serde(default)]
    fragment_ids: Vec<String>,
    #[serde(default)]
    note: String,
}

fn failed(msg: impl Into<String>) -> MemoryError {
    MemoryError::ConsolidationFailed(msg.into())
}

/// Build the user message listing every item with its id and cost.
fn build_request(memories: &[SearchResult], fragments: &[PromptFragment], query: &str, token_budget: usize) -> String {
    let mut out = format!("Query: {}\nToken budget: {}\n\nMemories:\n", query, token_budget);
    for r in memories {
        out.push_str(&format!(
            "- id={} similarity={:.2} [{}] {}\n",
            r.memory.id, r.similarity_score, r.memory.category, r.memory.content
        ));
    }
    out.push_str("\nFragments:\n");
    for f in fragments {
        out.push_str(&format!("- id={} priority={} [{}] {}\n", f.id, f.priority, f.category, f.content));
    }
    out
}

/// Pull the JSON object out of a reply that may be fenced or chatty.
fn extract_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

/// Apply the model's selection to the inputs, keeping their original order.
/// Unknown ids are ignored; an empty selection is a failure.
pub(crate) fn apply_selection(
    reply: &str,
    memories: &[SearchResult],
    fragments: &[PromptFragment],
) -> MemoryResult<Consolidated> {
    let body = extract_json(reply).ok_or_else(|| failed("reply contained no JSON object"))?;
    let selection: Selection =
        serde_json::from_str(body).map_err(|e| failed(format!("unparseable selection: {}", e)))?;

    let keep_m: HashSet<&str> = selection.memory_ids.iter().map(String::as_str).collect();
    let keep_f: HashSet<&str> = selection.fragment_ids.iter().map(String::as_str).collect();
    let kept_memories: Vec<SearchResult> = memories
        .iter()
        .filter(|r| keep_m.contains(r.memory.id.as_str()))
        .cloned()
        .collect();
    let kept_fragments: Vec<PromptFragment> = fragments
        .iter()
        .filter(|f| keep_f.contains(f.id.as_str()))
        .cloned()
        .collect();

    if kept_memories.is_empty() && kept_fragments.is_empty() {
        return Err(failed("selection kept nothing"));
    }
    Ok(Consolidated {
        memories: kept_memories,
        fragments: kept_fragments,
        note: selection.note.trim().to_string(),
    })
}

pub struct LlmConsolidator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl LlmConsolidator {
    pub fn new(config: &ConsolidationConfig) -> Self {
        info!("[consolidation] Using {} at {}", config.model, config.base_url);
        LlmConsolidator {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    async fn complete(&self, user_message: String) -> MemoryResult<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_message },
            ],
        });
        let mut req = self.client.post(&url).json(&body).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| failed(format!("{} unreachable: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(failed(format!("{} returned {}: {}", url, status, text)));
        }
        let v: Value = resp
            .json()
            .await
            .map_err(|e| failed(format!("invalid response JSON: {}", e)))?;
        v["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| failed("response had no choices[0].message.content"))
    }
}

#[async_trait]
impl Consolidator for LlmConsolidator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn consolidate(
        &self,
        memories: &[SearchResult],
        fragments: &[PromptFragment],
        query: &str,
        token_budget: usize,
    ) -> MemoryResult<Consolidated> {
        let reply = self
            .complete(build_request(memories, fragments, query, token_budget))
            .await
            .inspect_err(|e| warn!("[consolidation] {}", e))?;
        let out = apply_selection(&reply, memories, fragments)?;
        info!(
            "[consolidation] kept {}/{} memories, {}/{} fragments",
            out.memories.len(),
            memories.len(),
            out.fragments.len(),
            fragments.len()
        );
        Ok(out)
    }
}
