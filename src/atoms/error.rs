// ── Merchant Memory Atoms: Error Types ─────────────────────────────────────
// Single canonical error enum for the memory core, built with `thiserror`.
//
// Design rules:
//   • Infrastructure variants (Database, Pool) are classified by the pool
//     manager into busy / broken / permanent before any retry happens.
//   • Degradable failures (embedding, consolidation) have their own variants
//     so callers can `match` on them instead of string-sniffing.
//   • Logical failures (NotFound, Validation) are never retried.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Pool exhausted / unreachable after retries, gate closed, or a
    /// statement ran past its timeout. Fatal to the calling request only.
    #[error("Storage unavailable during {op} after {attempts} attempt(s): {message}")]
    StorageUnavailable {
        op: &'static str,
        attempts: u32,
        message: String,
    },

    /// The embedding collaborator failed. Callers degrade to text search.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The consolidation collaborator failed. Callers degrade to truncation.
    #[error("Consolidation failed: {0}")]
    ConsolidationFailed(String),

    /// Update/delete addressed a row that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input rejected before any I/O.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The bounded usage queue is full.
    #[error("Usage queue is full")]
    QueueFull,

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection checkout failure.
    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Filesystem failure (config loading, database directory creation).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is invalid or unreadable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for failures that do not warrant a dedicated variant
    /// (e.g. a blocking task that panicked).
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl MemoryError {
    pub fn storage_unavailable(op: &'static str, attempts: u32, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            op,
            attempts,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// True for errors the caller should degrade around rather than surface.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable(_) | Self::ConsolidationFailed(_)
        )
    }
}

impl From<toml::de::Error> for MemoryError {
    fn from(e: toml::de::Error) -> Self {
        MemoryError::Config(e.to_string())
    }
}

// ── Conversion: MemoryError → String ──────────────────────────────────────
// Lets API-layer handlers that speak `Result<T, String>` use `?` directly.

impl From<MemoryError> for String {
    fn from(e: MemoryError) -> Self {
        e.to_string()
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All memory-core operations return this type.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_unavailable_message_names_operation() {
        let e = MemoryError::storage_unavailable("insert_memory", 4, "database is locked");
        let msg = e.to_string();
        assert!(msg.contains("insert_memory"));
        assert!(msg.contains("4 attempt"));
    }

    #[test]
    fn degradable_classification() {
        assert!(MemoryError::EmbeddingUnavailable("down".into()).is_degradable());
        assert!(MemoryError::ConsolidationFailed("bad json".into()).is_degradable());
        assert!(!MemoryError::NotFound("m1".into()).is_degradable());
        assert!(!MemoryError::QueueFull.is_degradable());
    }
}
