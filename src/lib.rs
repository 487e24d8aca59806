// Merchant Memory: semantic memory core for e-commerce operations agents.
//
// Layout:
//   atoms/   pure types, constants, traits, errors
//   engine/  pool, store, dedup, decay, usage, retrieval, assembly, service

pub mod atoms;
pub mod engine;

pub use atoms::error::{MemoryError, MemoryResult};
pub use atoms::traits::{Consolidated, Consolidator, Embedder, Embedding};
pub use atoms::types::{
    ContextTier, DedupType, Memory, MemoryCandidate, MemoryCategory, MemoryId, MemoryStats, MemoryStatus,
    PromptFragment, SearchResult, StoreOutcome, VerificationStatus,
};
pub use engine::assembler::{AssembledPrompt, ConsolidationOutcome};
pub use engine::config::MemoryConfig;
pub use engine::service::MemoryService;
pub use engine::usage::UsageReport;
