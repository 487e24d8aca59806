// ── Merchant Memory Engine ─────────────────────────────────────────────────
// Storage, dedup, decay, retrieval and prompt assembly. Everything with I/O
// lives here; pure types live in atoms/.

pub mod assembler;
pub mod config;
pub mod consolidation;
pub mod decay;
pub mod dedup;
pub mod embedding;
pub mod pool;
pub mod retrieval;
pub mod service;
pub mod store;
pub mod tokenizer;
pub mod usage;
