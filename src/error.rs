//! Error types for persona-memory

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for persona-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// External collaborator that a call was routed through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Embedding,
    Extraction,
    Judgment,
    Answer,
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Port::Embedding => write!(f, "embedding"),
            Port::Extraction => write!(f, "extraction"),
            Port::Judgment => write!(f, "judgment"),
            Port::Answer => write!(f, "answer"),
        }
    }
}

/// Errors that can occur in persona-memory
#[derive(Error, Debug)]
pub enum Error {
    #[error("{port} port unavailable: {message}")]
    PortUnavailable { port: Port, message: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding component {position} is not a finite number")]
    NonFiniteEmbedding { position: usize },

    #[error("Version conflict on record {id}: expected {expected}, found {actual}")]
    VersionConflict { id: Uuid, expected: u64, actual: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Consistency violation in persona '{persona}': {detail}")]
    ConsistencyViolation { persona: String, detail: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn port(port: Port, msg: impl Into<String>) -> Self {
        Self::PortUnavailable {
            port,
            message: msg.into(),
        }
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::port(Port::Embedding, msg)
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::port(Port::Extraction, msg)
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn consistency(persona: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            persona: persona.into(),
            detail: detail.into(),
        }
    }

    /// Whether the failure should be retried by re-reading state
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
