// ── Merchant Memory Atoms: Constants ───────────────────────────────────────
// All named constants for the crate live here.
// Configurable knobs default to these values (see engine/config.rs); the
// rest are fixed parts of the scoring formulas.

// ── Connection pool ───────────────────────────────────────────────────────
pub const DEFAULT_MIN_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 30;
pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
/// Permits on the bounded-concurrency gate in front of the pool.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Backoff unit for broken-connection errors (× attempt).
pub const BROKEN_BACKOFF_MS: u64 = 100;
/// Backoff unit for busy/locked errors (× attempt).
pub const BUSY_BACKOFF_MS: u64 = 200;

// ── Candidates ────────────────────────────────────────────────────────────
/// Longest memory content accepted by `store`, in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

// ── Deduplication ─────────────────────────────────────────────────────────
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.95;
pub const DEFAULT_KEY_PHRASE_THRESHOLD: f64 = 0.80;
pub const DEFAULT_SEMANTIC_THRESHOLD: f64 = 0.85;
/// Most recent same-category memories compared by the window layers.
pub const DEFAULT_DEDUP_WINDOW: usize = 100;
/// Tokens shorter than this are ignored by the key-phrase layer.
pub const KEY_PHRASE_MIN_LEN: usize = 4;

// ── Decay & usage ─────────────────────────────────────────────────────────
pub const NEUTRAL_USEFULNESS: f64 = 0.5;
pub const DEFAULT_IMPORTANCE: f64 = 0.5;
pub const DEFAULT_CONFIDENCE: f64 = 0.5;
/// Weight of ln(1 + access_count) in the effective-importance boost.
pub const ACCESS_BOOST_WEIGHT: f64 = 0.1;
/// Ephemeral memories decay this many times faster than their category.
pub const EPHEMERAL_DECAY_MULTIPLIER: f64 = 4.0;
pub const DEFAULT_EPHEMERAL_MAX_AGE_DAYS: i64 = 7;
pub const DEFAULT_STALE_AFTER_DAYS: i64 = 60;
pub const DEFAULT_USED_BOOST: f64 = 0.1;
pub const DEFAULT_UNUSED_PENALTY: f64 = 0.05;
pub const DEFAULT_ARCHIVE_THRESHOLD: f64 = 0.1;
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 500;
/// Analytics events older than this are pruned by scheduled maintenance.
pub const DEFAULT_ANALYTICS_RETENTION_DAYS: i64 = 90;
/// Verification multipliers / bonus.
pub const VERIFIED_IMPORTANCE_MULTIPLIER: f64 = 1.2;
pub const VERIFIED_DECAY_MULTIPLIER: f64 = 0.8;
pub const VERIFIED_USEFULNESS_BONUS: f64 = 0.2;
/// A memory counts as "used" when this many of its keywords appear in a reply.
pub const USAGE_MIN_SHARED_KEYWORDS: usize = 2;
/// Keywords must be strictly longer than this.
pub const USAGE_KEYWORD_MIN_LEN: usize = 4;
pub const DEFAULT_USAGE_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_USAGE_WORKERS: usize = 2;

// ── Prompt assembly ───────────────────────────────────────────────────────
pub const CHARS_PER_TOKEN: f32 = 4.0;
/// Fragments fetched per assembly.
pub const MAX_FRAGMENTS: usize = 10;
/// Memories rendered into the final prompt.
pub const MAX_RENDERED_MEMORIES: usize = 5;
/// Items of each kind kept when consolidation is unavailable.
pub const TRUNCATION_KEEP: usize = 3;

// ── Search ────────────────────────────────────────────────────────────────
/// Used by `search_memories` when the caller gives no threshold.
pub const DEFAULT_SEARCH_THRESHOLD: f64 = 0.5;
pub const DEFAULT_SEARCH_LIMIT: usize = 10;
/// Rows embedded per backfill call when no limit is given.
pub const DEFAULT_BACKFILL_BATCH: usize = 500;

// ── Embedding collaborator ────────────────────────────────────────────────
pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_EMBEDDING_CACHE: usize = 1024;
