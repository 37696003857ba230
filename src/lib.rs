//! # Persona Memory
//!
//! Per-persona long-term memory that reconciles new facts against what is
//! already known and answers queries with source-tagged context.
//!
//! ## Architecture
//!
//! - **Record Store + Vector Index** - authoritative records and their derived
//!   similarity index, always updated together
//! - **Reconciler** - maps each candidate fact to ADD, UPDATE, DELETE+ADD or NONE
//! - **Audit Log** - append-only history in SQLite, replayable to any point
//! - **Short-Term Buffer** - volatile ring of recent raw messages
//! - **Retriever** - merges long-term and short-term hits for an answer
//!
//! ## Usage
//!
//! ```rust,ignore
//! use persona_memory::{Config, MemoryEngine, Ports};
//!
//! let config = Config::default();
//! let engine = MemoryEngine::open(config, Ports::offline(384)).await?;
//!
//! // Record a message and reconcile the facts it states
//! let entries = engine.add_message("u1", "Favourite food is sushi").await?;
//!
//! // Retrieve source-tagged context
//! let hits = engine.search("u1", "What food do I like?", 2).await?;
//!
//! // Undo everything after the first entry
//! engine.rollback("u1", 1).await?;
//! ```

pub mod audit;
pub mod config;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod ports;
pub mod reconciler;
pub mod retrieval;
pub mod short_term;
pub mod storage;
mod text;

pub use audit::{AuditAction, AuditEntry, Snapshot};
pub use config::{Config, EmbeddingBackend};
pub use embedding::{FastEmbedder, HashingEmbedder, TokenCounter};
pub use error::{Error, Port, Result};
pub use memory::{Answer, MemoryEngine, MemoryRecord, Ports, RecordState};
pub use ports::{
    AnswerGenerator, Embedder, ExtractiveAnswerer, FactExtractor, Judgment, SemanticJudge,
    SentenceExtractor,
};
pub use retrieval::{MemoryTier, RankedContext, RetrievedHit};
pub use short_term::{ShortTermBuffer, ShortTermEntry};
pub use text::has_negation;
