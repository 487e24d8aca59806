// ── Merchant Memory: HTTP Embedding Client ─────────────────────────────────
//
// Reference `Embedder` for Ollama or any OpenAI-compatible embedding API.
// Tries Ollama's /api/embed, then the legacy /api/embeddings, then
// /v1/embeddings. Every failure surfaces as `EmbeddingUnavailable` so the
// store can fall back to text search.
//
// Results are cached per exact input text (bounded, oldest evicted first).

use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::traits::{Embedder, Embedding};
use crate::engine::config::EmbeddingConfig;
use crate::engine::tokenizer::Tokenizer;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Bounded FIFO cache of text → vector.
struct EmbeddingCache {
    capacity: usize,
    entries: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        EmbeddingCache {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.entries.get(text).cloned()
    }

    fn put(&mut self, text: &str, vector: Vec<f32>) {
        if self.capacity == 0 || self.entries.contains_key(text) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(text.to_string());
        self.entries.insert(text.to_string(), vector);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn parse_vector(v: &Value) -> Option<Vec<f32>> {
    let vec: Vec<f32> = v
        .as_array()?
        .iter()
        .filter_map(|x| x.as_f64().map(|f| f as f32))
        .collect();
    (!vec.is_empty()).then_some(vec)
}

fn unavailable(msg: impl Into<String>) -> MemoryError {
    MemoryError::EmbeddingUnavailable(msg.into())
}

pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
    cache: Mutex<EmbeddingCache>,
    tokenizer: Tokenizer,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        info!("[embedding] Using {} at {}", config.model, config.base_url);
        HttpEmbedder {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            cache: Mutex::new(EmbeddingCache::new(config.cache_capacity)),
            tokenizer: Tokenizer::default(),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    /// POST `body` to `path`, returning the JSON body of a 2xx response.
    async fn post(&self, path: &str, body: Value) -> MemoryResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| unavailable(format!("{} unreachable: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(unavailable(format!("{} returned {}: {}", url, status, text)));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| unavailable(format!("{} sent invalid JSON: {}", url, e)))
    }

    /// Ollama 0.4+: POST /api/embed { model, input } → { embeddings: [[..]] }.
    /// Some versions answer with a singular `embedding`.
    async fn embed_ollama(&self, text: &str) -> MemoryResult<(Vec<f32>, Option<usize>)> {
        let v = self
            .post("/api/embed", json!({ "model": self.model, "input": text }))
            .await?;
        let tokens = v["prompt_eval_count"].as_u64().map(|n| n as usize);
        v["embeddings"]
            .get(0)
            .and_then(parse_vector)
            .or_else(|| parse_vector(&v["embedding"]))
            .map(|vec| (vec, tokens))
            .ok_or_else(|| unavailable("no embedding in /api/embed response"))
    }

    /// Legacy Ollama: POST /api/embeddings { model, prompt } → { embedding: [..] }.
    async fn embed_ollama_legacy(&self, text: &str) -> MemoryResult<(Vec<f32>, Option<usize>)> {
        let v = self
            .post("/api/embeddings", json!({ "model": self.model, "prompt": text }))
            .await?;
        parse_vector(&v["embedding"])
            .map(|vec| (vec, None))
            .ok_or_else(|| unavailable("no embedding in /api/embeddings response"))
    }

    /// OpenAI-compatible: POST /v1/embeddings { model, input } → { data: [{ embedding }] }.
    async fn embed_openai(&self, text: &str) -> MemoryResult<(Vec<f32>, Option<usize>)> {
        let v = self
            .post("/v1/embeddings", json!({ "model": self.model, "input": text }))
            .await?;
        let tokens = v["usage"]["prompt_tokens"].as_u64().map(|n| n as usize);
        parse_vector(&v["data"][0]["embedding"])
            .map(|vec| (vec, tokens))
            .ok_or_else(|| unavailable("no data[0].embedding in /v1/embeddings response"))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> MemoryResult<Embedding> {
        if let Some(vector) = self.cache.lock().get(text) {
            return Ok(Embedding {
                vector,
                token_count: self.tokenizer.count_tokens(text),
                from_cache: true,
            });
        }

        let result = match self.embed_ollama(text).await {
            Ok(r) => Ok(r),
            Err(first) => {
                debug!("[embedding] /api/embed failed ({}), trying legacy endpoint", first);
                match self.embed_ollama_legacy(text).await {
                    Ok(r) => Ok(r),
                    Err(_) => self.embed_openai(text).await.map_err(|last| {
                        unavailable(format!("all endpoints failed. Ollama: {} | OpenAI: {}", first, last))
                    }),
                }
            }
        };

        match result {
            Ok((vector, tokens)) => {
                self.cache.lock().put(text, vector.clone());
                Ok(Embedding {
                    vector,
                    token_count: tokens.unwrap_or_else(|| self.tokenizer.count_tokens(text)),
                    from_cache: false,
                })
            }
            Err(e) => {
                warn!("[embedding] {}", e);
                Err(e)
            }
        }
    }
}
