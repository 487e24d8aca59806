// ── Merchant Memory Atoms: Data Model ──────────────────────────────────────
//
// Pure data types for the memory core (no logic beyond validation, no DB
// access, no I/O). Row mapping lives in engine/store/; scoring lives in
// engine/decay.rs and engine/dedup.rs.

use crate::atoms::constants::{
    DEFAULT_CONFIDENCE, DEFAULT_IMPORTANCE, MAX_CONTENT_CHARS, NEUTRAL_USEFULNESS,
};
use crate::atoms::error::{MemoryError, MemoryResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// System-assigned memory identifier (UUID v4, hyphenated).
pub type MemoryId = String;

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Enumerations
// ═══════════════════════════════════════════════════════════════════════════

/// Closed set of memory categories. Scopes both decay rate and dedup
/// comparison (the window layers only compare within a category).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Preferences,
    Facts,
    Problems,
    Solutions,
    Relationships,
    Expertise,
    Interactions,
    #[default]
    General,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 8] = [
        MemoryCategory::Preferences,
        MemoryCategory::Facts,
        MemoryCategory::Problems,
        MemoryCategory::Solutions,
        MemoryCategory::Relationships,
        MemoryCategory::Expertise,
        MemoryCategory::Interactions,
        MemoryCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Preferences => "preferences",
            MemoryCategory::Facts => "facts",
            MemoryCategory::Problems => "problems",
            MemoryCategory::Solutions => "solutions",
            MemoryCategory::Relationships => "relationships",
            MemoryCategory::Expertise => "expertise",
            MemoryCategory::Interactions => "interactions",
            MemoryCategory::General => "general",
        }
    }

    /// Per-day decay rate. Smaller = slower decay.
    pub fn default_decay_rate(&self) -> f64 {
        match self {
            MemoryCategory::Preferences => 0.005,
            MemoryCategory::Facts | MemoryCategory::Expertise => 0.008,
            MemoryCategory::Relationships => 0.010,
            MemoryCategory::Solutions => 0.012,
            MemoryCategory::Problems => 0.015,
            MemoryCategory::Interactions => 0.020,
            MemoryCategory::General => 0.015,
        }
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryCategory {
    type Err = MemoryError;

    fn from_str(s: &str) -> MemoryResult<Self> {
        let needle = s.trim().to_ascii_lowercase();
        MemoryCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == needle)
            // singular forms show up in classifier output ("preference", "fact")
            .or_else(|| {
                MemoryCategory::ALL
                    .iter()
                    .copied()
                    .find(|c| c.as_str().trim_end_matches('s') == needle)
            })
            .ok_or_else(|| MemoryError::validation(format!("unknown memory category '{}'", s)))
    }
}

/// Row lifecycle. Only `Active` rows are visible to retrieval; every other
/// state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Active,
    Archived,
    Deduplicated,
    Deleted,
}

impl MemoryStatus {
    pub const ALL: [MemoryStatus; 4] = [
        MemoryStatus::Active,
        MemoryStatus::Archived,
        MemoryStatus::Deduplicated,
        MemoryStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Archived => "archived",
            MemoryStatus::Deduplicated => "deduplicated",
            MemoryStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryStatus {
    type Err = MemoryError;

    fn from_str(s: &str) -> MemoryResult<Self> {
        MemoryStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s.trim())
            .ok_or_else(|| MemoryError::validation(format!("unknown memory status '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Unverified,
    Verified,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::Verified => "verified",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "verified" {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Unverified
        }
    }
}

/// Which dedup layer produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupType {
    Exact,
    Fuzzy,
    KeyPhrase,
    Semantic,
}

impl DedupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupType::Exact => "exact",
            DedupType::Fuzzy => "fuzzy",
            DedupType::KeyPhrase => "key_phrase",
            DedupType::Semantic => "semantic",
        }
    }
}

impl fmt::Display for DedupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupType {
    type Err = MemoryError;

    fn from_str(s: &str) -> MemoryResult<Self> {
        match s {
            "exact" => Ok(DedupType::Exact),
            "fuzzy" => Ok(DedupType::Fuzzy),
            "key_phrase" => Ok(DedupType::KeyPhrase),
            "semantic" => Ok(DedupType::Semantic),
            other => Err(MemoryError::validation(format!("unknown dedup type '{}'", other))),
        }
    }
}

/// Named token budget for prompt assembly. Ordered: a fragment scoped to
/// `Core` is also eligible for `Standard` and `Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    Core,
    #[default]
    Standard,
    Full,
}

impl ContextTier {
    pub const ALL: [ContextTier; 3] = [ContextTier::Core, ContextTier::Standard, ContextTier::Full];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextTier::Core => "core",
            ContextTier::Standard => "standard",
            ContextTier::Full => "full",
        }
    }

    /// (budget_tokens, memory_limit, similarity_threshold)
    pub fn defaults(&self) -> (usize, usize, f64) {
        match self {
            ContextTier::Core => (2000, 5, 0.3),
            ContextTier::Standard => (4000, 10, 0.25),
            ContextTier::Full => (8000, 20, 0.2),
        }
    }
}

impl fmt::Display for ContextTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextTier {
    type Err = MemoryError;

    fn from_str(s: &str) -> MemoryResult<Self> {
        ContextTier::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| MemoryError::validation(format!("unknown context tier '{}'", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Memory
// ═══════════════════════════════════════════════════════════════════════════

/// Input contract for `store()`: the shape the memory-worthiness classifier
/// produces for a sentence it judged worth keeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCandidate {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub category: MemoryCategory,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub is_ephemeral: bool,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

fn default_importance() -> f64 {
    DEFAULT_IMPORTANCE
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl MemoryCandidate {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>, category: MemoryCategory) -> Self {
        Self {
            user_id: user_id.into(),
            content: content.into(),
            category,
            importance: DEFAULT_IMPORTANCE,
            confidence: DEFAULT_CONFIDENCE,
            is_ephemeral: false,
            metadata: empty_metadata(),
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.is_ephemeral = true;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject malformed candidates before any I/O happens.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(MemoryError::validation("user_id must not be empty"));
        }
        if self.content.trim().is_empty() {
            return Err(MemoryError::validation("content must not be empty"));
        }
        let chars = self.content.chars().count();
        if chars > MAX_CONTENT_CHARS {
            return Err(MemoryError::validation(format!(
                "content is {} characters, the limit is {}",
                chars, MAX_CONTENT_CHARS
            )));
        }
        check_unit_interval("importance", self.importance)?;
        check_unit_interval("confidence", self.confidence)?;
        if !self.metadata.is_object() && !self.metadata.is_null() {
            return Err(MemoryError::validation("metadata must be a JSON object"));
        }
        Ok(())
    }
}

/// Score fields are defined on [0,1]; anything else is a caller bug.
pub fn check_unit_interval(field: &str, value: f64) -> MemoryResult<()> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(MemoryError::validation(format!(
            "{} must be within [0, 1], got {}",
            field, value
        )));
    }
    Ok(())
}

/// A durable fact about a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    pub id: MemoryId,
    pub user_id: String,
    pub content: String,
    /// SHA-256 (hex) of the dedup-normalized content.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Value,
    pub category: MemoryCategory,
    pub importance_score: f64,
    pub confidence_score: f64,
    pub access_count: i64,
    pub usefulness_score: f64,
    pub decay_rate: f64,
    pub verification_status: VerificationStatus,
    pub status: MemoryStatus,
    pub is_ephemeral: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    /// Build a fresh active row from an already-normalized candidate.
    pub fn from_candidate(
        candidate: MemoryCandidate,
        content_hash: String,
        embedding: Option<Vec<f32>>,
        now: DateTime<Utc>,
    ) -> Self {
        let metadata = if candidate.metadata.is_null() {
            empty_metadata()
        } else {
            candidate.metadata
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: candidate.user_id,
            content: candidate.content,
            content_hash,
            embedding,
            metadata,
            category: candidate.category,
            importance_score: candidate.importance,
            confidence_score: candidate.confidence,
            access_count: 0,
            usefulness_score: NEUTRAL_USEFULNESS,
            decay_rate: candidate.category.default_decay_rate(),
            verification_status: VerificationStatus::Unverified,
            status: MemoryStatus::Active,
            is_ephemeral: candidate.is_ephemeral,
            created_at: now,
            last_accessed_at: None,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MemoryStatus::Active
    }

    /// Reference time for staleness: last access, else creation.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.last_accessed_at.unwrap_or(self.created_at)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: Fragments, Duplicates, Results
// ═══════════════════════════════════════════════════════════════════════════

/// Curated, non-user-specific guidance injected into agent prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptFragment {
    pub id: String,
    pub category: String,
    /// Higher first.
    pub priority: i32,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// None = applies to every agent type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    /// Smallest tier this fragment is eligible for.
    pub context_tier: ContextTier,
    pub is_active: bool,
}

impl PromptFragment {
    pub fn new(category: impl Into<String>, content: impl Into<String>, tier: ContextTier) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category: category.into(),
            priority: 0,
            content: content.into(),
            tags: Vec::new(),
            agent_type: None,
            context_tier: tier,
            is_active: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_agent(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Provenance of a dedup decision. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateRecord {
    pub original_id: MemoryId,
    pub duplicate_content_hash: String,
    pub similarity_score: f64,
    pub dedup_type: DedupType,
    pub created_at: DateTime<Utc>,
}

/// A retrieved memory with its score. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub memory: Memory,
    pub similarity_score: f64,
    /// 1-based position in the result list.
    pub rank: usize,
}

/// What `store()` did with a candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StoreOutcome {
    Inserted { id: MemoryId },
    Duplicate {
        id: MemoryId,
        dedup_type: DedupType,
        similarity: f64,
    },
}

impl StoreOutcome {
    pub fn id(&self) -> &MemoryId {
        match self {
            StoreOutcome::Inserted { id } | StoreOutcome::Duplicate { id, .. } => id,
        }
    }

    pub fn into_id(self) -> MemoryId {
        match self {
            StoreOutcome::Inserted { id } | StoreOutcome::Duplicate { id, .. } => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreOutcome::Duplicate { .. })
    }
}

/// Per-user aggregate view, for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub user_id: String,
    pub total: i64,
    pub active: i64,
    pub archived: i64,
    pub deduplicated: i64,
    pub deleted: i64,
    /// Active rows per category, largest first.
    pub categories: Vec<(String, i64)>,
    pub avg_importance: f64,
    pub avg_usefulness: f64,
    pub avg_access_count: f64,
    pub with_embeddings: i64,
    pub ephemeral: i64,
    pub verified: i64,
    pub duplicate_records: i64,
    /// Analytics events recorded for this user, by event name.
    pub events: Vec<(String, i64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parsing_accepts_singular_and_case() {
        assert_eq!("Preferences".parse::<MemoryCategory>().unwrap(), MemoryCategory::Preferences);
        assert_eq!("fact".parse::<MemoryCategory>().unwrap(), MemoryCategory::Facts);
        assert_eq!("general".parse::<MemoryCategory>().unwrap(), MemoryCategory::General);
        assert!("gossip".parse::<MemoryCategory>().is_err());
    }

    #[test]
    fn decay_rates_order_preferences_slowest() {
        let prefs = MemoryCategory::Preferences.default_decay_rate();
        for c in MemoryCategory::ALL {
            assert!(c.default_decay_rate() >= prefs, "{} decays slower than preferences", c);
        }
        assert_eq!(MemoryCategory::Interactions.default_decay_rate(), 0.020);
    }

    #[test]
    fn tier_order_and_defaults() {
        assert!(ContextTier::Core < ContextTier::Standard);
        assert!(ContextTier::Standard < ContextTier::Full);
        assert_eq!(ContextTier::Core.defaults(), (2000, 5, 0.3));
        assert_eq!("FULL".parse::<ContextTier>().unwrap(), ContextTier::Full);
        assert_eq!(ContextTier::default(), ContextTier::Standard);
        assert_eq!(MemoryCategory::default(), MemoryCategory::General);
    }

    #[test]
    fn candidate_validation() {
        let ok = MemoryCandidate::new("u1", "likes tea", MemoryCategory::Preferences);
        assert!(ok.validate().is_ok());

        let bad = ok.clone().with_importance(1.5);
        assert!(matches!(bad.validate(), Err(MemoryError::Validation(_))));

        let nan = ok.clone().with_confidence(f64::NAN);
        assert!(nan.validate().is_err());

        let empty = MemoryCandidate::new("u1", "   ", MemoryCategory::General);
        assert!(empty.validate().is_err());

        let no_user = MemoryCandidate::new("", "x", MemoryCategory::General);
        assert!(no_user.validate().is_err());

        let at_limit = MemoryCandidate::new("u1", "é".repeat(MAX_CONTENT_CHARS), MemoryCategory::Facts);
        assert!(at_limit.validate().is_ok());
        let too_long = MemoryCandidate::new("u1", "a".repeat(MAX_CONTENT_CHARS + 1), MemoryCategory::Facts);
        assert!(matches!(too_long.validate(), Err(MemoryError::Validation(_))));
    }

    #[test]
    fn from_candidate_starts_neutral() {
        let now = Utc::now();
        let cand = MemoryCandidate::new("u1", "prefers email", MemoryCategory::Preferences)
            .with_importance(0.8);
        let m = Memory::from_candidate(cand, "h".into(), None, now);
        assert_eq!(m.status, MemoryStatus::Active);
        assert_eq!(m.access_count, 0);
        assert_eq!(m.usefulness_score, NEUTRAL_USEFULNESS);
        assert_eq!(m.decay_rate, 0.005);
        assert!(m.metadata.is_object());
        assert_eq!(m.last_touched(), now);
    }

    #[test]
    fn store_outcome_id() {
        let a = StoreOutcome::Inserted { id: "a".into() };
        let b = StoreOutcome::Duplicate { id: "b".into(), dedup_type: DedupType::Exact, similarity: 1.0 };
        assert_eq!(a.id(), "a");
        assert!(!a.is_duplicate());
        assert!(b.is_duplicate());
        assert_eq!(b.into_id(), "b");
    }
}
