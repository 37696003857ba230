//! Configuration for persona-memory

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable pointing at a JSON config file
pub const CONFIG_PATH_ENV: &str = "PERSONA_MEMORY_CONFIG";

/// Environment variable overriding `data_dir`
pub const DATA_DIR_ENV: &str = "PERSONA_MEMORY_DATA_DIR";

/// Which embedding backend the server wires into the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Local ONNX model through fastembed
    Fastembed,
    /// Deterministic feature hashing, no model download
    Hashing,
}

/// Configuration for the memory system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Embedding model name (for reference, actual model set in embedding.rs)
    pub embedding_model: String,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Embedding backend used by the server binary
    pub embedding_backend: EmbeddingBackend,

    /// Number of neighbours inspected per candidate fact
    pub top_k: usize,

    /// Minimum similarity for an existing record to be considered a match
    pub consider_threshold: f32,

    /// Similarity at or above which a candidate is a duplicate
    pub duplicate_threshold: f32,

    /// Ring capacity of the short-term buffer, per persona
    pub short_term_capacity: usize,

    /// Maximum short-term hits merged into a retrieval result
    pub short_term_max_hits: usize,

    /// Minimum cosine score for a short-term entry to count as relevant
    pub short_term_min_score: f32,

    /// Minimum similarity score for long-term retrieval (0.0 - 1.0)
    pub min_retrieval_score: f32,

    /// Token budget for the context handed to the answer port
    pub max_context_tokens: u32,

    /// Timeout applied to every external port call, in milliseconds
    pub port_timeout_ms: u64,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("persona-memory");

        Self {
            data_dir,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dimensions: 384, // MiniLM-L6-v2 outputs 384-dim vectors
            embedding_backend: EmbeddingBackend::Fastembed,
            top_k: 5,
            consider_threshold: 0.75,
            duplicate_threshold: 0.92,
            short_term_capacity: 10,
            short_term_max_hits: 2,
            short_term_min_score: 0.5,
            min_retrieval_score: 0.0,
            max_context_tokens: 2000,
            port_timeout_ms: 30_000,
            server_port: 8420,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the config from the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the reconciler cannot work with
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("consider_threshold", self.consider_threshold),
            ("duplicate_threshold", self.duplicate_threshold),
            ("short_term_min_score", self.short_term_min_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config(format!("{name} must be within [0, 1], got {value}")));
            }
        }

        if self.consider_threshold > self.duplicate_threshold {
            return Err(Error::config(format!(
                "consider_threshold ({}) must not exceed duplicate_threshold ({})",
                self.consider_threshold, self.duplicate_threshold
            )));
        }

        if self.embedding_dimensions == 0 {
            return Err(Error::config("embedding_dimensions must be positive"));
        }

        if self.top_k == 0 || self.short_term_capacity == 0 {
            return Err(Error::config("top_k and short_term_capacity must be positive"));
        }

        Ok(())
    }

    /// Timeout for a single port call
    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}
