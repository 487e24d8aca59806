// Merchant Memory: Configuration
//
// Every knob the memory core exposes, grouped the way the TOML file is:
//   [database] [dedup] [decay] [usage] [tiers.*] [embedding]
//   [consolidation] [prompts]
// Every field has a default, so an empty file (or no file) is valid.

use crate::atoms::constants::*;
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::types::ContextTier;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Special database path that opens a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Default on-disk location: `~/.merchant-memory/memory.db`.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".merchant-memory")
        .join("memory.db")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub database: DatabaseConfig,
    pub dedup: DedupConfig,
    pub decay: DecayConfig,
    pub usage: UsageConfig,
    pub tiers: TierTable,
    pub embedding: EmbeddingConfig,
    pub consolidation: ConsolidationConfig,
    pub prompts: PromptConfig,
}

// ── [database] ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub statement_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub concurrency_limit: usize,
    pub max_retries: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path().to_string_lossy().into_owned(),
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl DatabaseConfig {
    /// Private in-memory database, small pool. Used by tests and dry runs.
    pub fn in_memory() -> Self {
        DatabaseConfig {
            path: IN_MEMORY.into(),
            min_connections: 1,
            max_connections: 4,
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

// ── [dedup] ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub fuzzy_threshold: f64,
    pub key_phrase_threshold: f64,
    pub semantic_threshold: f64,
    pub window: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            key_phrase_threshold: DEFAULT_KEY_PHRASE_THRESHOLD,
            semantic_threshold: DEFAULT_SEMANTIC_THRESHOLD,
            window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

// ── [decay] ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    pub archive_threshold: f64,
    pub ephemeral_max_age_days: i64,
    pub stale_after_days: i64,
    pub used_boost: f64,
    pub unused_penalty: f64,
    pub sweep_batch_size: usize,
    /// Seconds between scheduled archive sweeps (`spawn_maintenance`).
    pub sweep_interval_secs: u64,
    pub analytics_retention_days: i64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        DecayConfig {
            archive_threshold: DEFAULT_ARCHIVE_THRESHOLD,
            ephemeral_max_age_days: DEFAULT_EPHEMERAL_MAX_AGE_DAYS,
            stale_after_days: DEFAULT_STALE_AFTER_DAYS,
            used_boost: DEFAULT_USED_BOOST,
            unused_penalty: DEFAULT_UNUSED_PENALTY,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            sweep_interval_secs: 6 * 60 * 60,
            analytics_retention_days: DEFAULT_ANALYTICS_RETENTION_DAYS,
        }
    }
}

// ── [usage] ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub queue_capacity: usize,
    pub workers: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        UsageConfig {
            queue_capacity: DEFAULT_USAGE_QUEUE_CAPACITY,
            workers: DEFAULT_USAGE_WORKERS,
        }
    }
}

// ── [tiers.*] ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierSettings {
    pub budget_tokens: usize,
    pub memory_limit: usize,
    pub similarity_threshold: f64,
}

impl From<ContextTier> for TierSettings {
    fn from(tier: ContextTier) -> Self {
        let (budget_tokens, memory_limit, similarity_threshold) = tier.defaults();
        TierSettings {
            budget_tokens,
            memory_limit,
            similarity_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub core: TierSettings,
    pub standard: TierSettings,
    pub full: TierSettings,
}

impl Default for TierTable {
    fn default() -> Self {
        TierTable {
            core: ContextTier::Core.into(),
            standard: ContextTier::Standard.into(),
            full: ContextTier::Full.into(),
        }
    }
}

impl TierTable {
    pub fn get(&self, tier: ContextTier) -> TierSettings {
        match tier {
            ContextTier::Core => self.core,
            ContextTier::Standard => self.standard,
            ContextTier::Full => self.full,
        }
    }
}

// ── [embedding] / [consolidation] ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub cache_capacity: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            enabled: true,
            base_url: DEFAULT_EMBEDDING_URL.into(),
            model: DEFAULT_EMBEDDING_MODEL.into(),
            cache_capacity: DEFAULT_EMBEDDING_CACHE,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub enabled: bool,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        ConsolidationConfig {
            enabled: false,
            base_url: "http://localhost:11434".into(),
            api_key: None,
            model: "llama3.2".into(),
            timeout_secs: 60,
        }
    }
}

// ── [prompts] ──────────────────────────────────────────────────────────────

pub const DEFAULT_BASE_PROMPT: &str = "You are an operations assistant for an online store. \
Use what you know about the merchant to give specific, actionable answers.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub default_base_prompt: String,
    /// agent_type → base prompt
    pub agents: HashMap<String, String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        PromptConfig {
            default_base_prompt: DEFAULT_BASE_PROMPT.into(),
            agents: HashMap::new(),
        }
    }
}

impl PromptConfig {
    pub fn base_prompt_for(&self, agent_type: &str) -> &str {
        self.agents
            .get(agent_type)
            .map(String::as_str)
            .unwrap_or(&self.default_base_prompt)
    }
}

// ── Loading & validation ───────────────────────────────────────────────────

impl MemoryConfig {
    /// Config for an in-memory database with no network collaborators.
    pub fn in_memory() -> Self {
        MemoryConfig {
            database: DatabaseConfig::in_memory(),
            embedding: EmbeddingConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> MemoryResult<Self> {
        let config: MemoryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> MemoryResult<Self> {
        if !path.exists() {
            info!("[memory] No config at {:?}, using defaults", path);
            let config = MemoryConfig::default();
            config.validate()?;
            return Ok(config);
        }
        let content = std::fs::read_to_string(path)?;
        info!("[memory] Loaded config from {:?}", path);
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> MemoryResult<()> {
        let db = &self.database;
        if db.max_connections == 0 {
            return Err(MemoryError::Config("database.max_connections must be > 0".into()));
        }
        if db.min_connections > db.max_connections {
            return Err(MemoryError::Config(format!(
                "database.min_connections ({}) exceeds max_connections ({})",
                db.min_connections, db.max_connections
            )));
        }
        if db.concurrency_limit == 0 {
            return Err(MemoryError::Config("database.concurrency_limit must be > 0".into()));
        }
        if db.statement_timeout_ms == 0 {
            return Err(MemoryError::Config("database.statement_timeout_ms must be > 0".into()));
        }

        for (name, value) in [
            ("dedup.fuzzy_threshold", self.dedup.fuzzy_threshold),
            ("dedup.key_phrase_threshold", self.dedup.key_phrase_threshold),
            ("dedup.semantic_threshold", self.dedup.semantic_threshold),
            ("decay.archive_threshold", self.decay.archive_threshold),
            ("decay.used_boost", self.decay.used_boost),
            ("decay.unused_penalty", self.decay.unused_penalty),
            ("tiers.core.similarity_threshold", self.tiers.core.similarity_threshold),
            ("tiers.standard.similarity_threshold", self.tiers.standard.similarity_threshold),
            ("tiers.full.similarity_threshold", self.tiers.full.similarity_threshold),
        ] {
            if value.is_nan() || !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::Config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }

        if self.decay.analytics_retention_days < 1 {
            return Err(MemoryError::Config("decay.analytics_retention_days must be >= 1".into()));
        }
        if self.dedup.window == 0 {
            return Err(MemoryError::Config("dedup.window must be > 0".into()));
        }
        if self.usage.queue_capacity == 0 || self.usage.workers == 0 {
            return Err(MemoryError::Config("usage.queue_capacity and usage.workers must be > 0".into()));
        }
        for tier in ContextTier::ALL {
            let t = self.tiers.get(tier);
            if t.budget_tokens == 0 || t.memory_limit == 0 {
                return Err(MemoryError::Config(format!("tiers.{} needs a non-zero budget and memory limit", tier)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let c = MemoryConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.database.min_connections, 10);
        assert_eq!(c.database.max_connections, 30);
        assert_eq!(c.database.concurrency_limit, 4);
        assert_eq!(c.dedup.window, 100);
        assert!(c.database.path.ends_with("memory.db"));
    }

    #[test]
    fn rejects_zero_analytics_retention() {
        let mut c = MemoryConfig::default();
        c.decay.analytics_retention_days = 0;
        assert!(matches!(c.validate(), Err(MemoryError::Config(_))));
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let c = MemoryConfig::from_toml_str("").unwrap();
        assert_eq!(c.dedup.fuzzy_threshold, 0.95);
        assert_eq!(c.tiers.get(ContextTier::Full).budget_tokens, 8000);
    }

    #[test]
    fn partial_toml_overrides_only_named_keys() {
        let c = MemoryConfig::from_toml_str(
            r#"
            [database]
            path = ":memory:"
            max_connections = 8
            min_connections = 2

            [dedup]
            semantic_threshold = 0.9

            [tiers.core]
            budget_tokens = 1000
            memory_limit = 3
            similarity_threshold = 0.4

            [prompts.agents]
            inventory = "You manage stock levels."
            "#,
        )
        .unwrap();
        assert!(c.database.is_in_memory());
        assert_eq!(c.database.max_connections, 8);
        assert_eq!(c.database.statement_timeout_ms, 30_000);
        assert_eq!(c.dedup.semantic_threshold, 0.9);
        assert_eq!(c.dedup.fuzzy_threshold, 0.95);
        assert_eq!(c.tiers.core.budget_tokens, 1000);
        assert_eq!(c.tiers.standard.budget_tokens, 4000);
        assert_eq!(c.prompts.base_prompt_for("inventory"), "You manage stock levels.");
        assert_eq!(c.prompts.base_prompt_for("support"), DEFAULT_BASE_PROMPT);
    }

    #[test]
    fn rejects_min_over_max() {
        let mut c = MemoryConfig::in_memory();
        c.database.min_connections = 5;
        c.database.max_connections = 2;
        assert!(matches!(c.validate(), Err(MemoryError::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = MemoryConfig::from_toml_str("[dedup]\nfuzzy_threshold = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("fuzzy_threshold"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = MemoryConfig::from_toml_str("[database\npath = 1").unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let c = MemoryConfig::load(Path::new("/definitely/not/here/merchant-memory.toml")).unwrap();
        assert_eq!(c.usage.workers, 2);
    }
}
