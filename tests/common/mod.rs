//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use persona_memory::{
    AuditAction, AuditEntry, Config, Embedder, Error, FactExtractor, HashingEmbedder, Judgment,
    MemoryEngine, Ports, Result, SemanticJudge,
};

pub const DIMS: usize = 384;

pub fn offline_config() -> Config {
    Config {
        embedding_backend: persona_memory::EmbeddingBackend::Hashing,
        ..Config::default()
    }
}

pub async fn engine() -> MemoryEngine {
    MemoryEngine::in_memory(offline_config(), Ports::offline(DIMS))
        .await
        .expect("in-memory engine")
}

pub async fn engine_with(ports: Ports) -> MemoryEngine {
    MemoryEngine::in_memory(offline_config(), ports)
        .await
        .expect("in-memory engine")
}

pub fn actions(entries: &[AuditEntry]) -> Vec<AuditAction> {
    entries.iter().map(|e| e.action).collect()
}

pub fn facts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub async fn active_contents(engine: &MemoryEngine, persona: &str) -> Vec<String> {
    engine
        .list_active(persona)
        .await
        .expect("list active")
        .into_iter()
        .map(|r| r.content)
        .collect()
}

/// The index must hold exactly the active records
pub async fn assert_index_matches_store(engine: &MemoryEngine, persona: &str) {
    let mut active: Vec<_> = engine
        .list_active(persona)
        .await
        .expect("list active")
        .iter()
        .map(|r| r.id)
        .collect();
    active.sort();
    assert_eq!(engine.indexed_ids(persona).await.expect("indexed ids"), active);
}

/// Sequence numbers must be exactly 1..=n
pub fn assert_contiguous(entries: &[AuditEntry]) {
    let seqs: Vec<u64> = entries.iter().map(|e| e.sequence_no).collect();
    let expected: Vec<u64> = (1..=entries.len() as u64).collect();
    assert_eq!(seqs, expected);
}

/// Hashing embedder that misbehaves on marked texts
pub struct FlakyEmbedder {
    inner: HashingEmbedder,
}

impl FlakyEmbedder {
    pub fn new() -> Self {
        Self {
            inner: HashingEmbedder::new(DIMS),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed(&self, text: &str, persona: &str) -> Result<Vec<f32>> {
        if text.contains("offline") {
            return Err(Error::embedding("embedding service offline"));
        }
        if text.contains("truncated") {
            return Ok(vec![1.0, 0.0, 0.0]);
        }
        if text.contains("glitch") {
            let mut v = self.inner.embed(text, persona).await?;
            v[0] = f32::NAN;
            return Ok(v);
        }
        if text.contains("sluggish") {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        self.inner.embed(text, persona).await
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

pub struct BrokenExtractor;

#[async_trait]
impl FactExtractor for BrokenExtractor {
    async fn extract(&self, _message: &str, _recent: &[String]) -> Result<Vec<String>> {
        Err(Error::extraction("extractor offline"))
    }
}

pub fn flaky_ports() -> Ports {
    let offline = Ports::offline(DIMS);
    Ports::new(Arc::new(FlakyEmbedder::new()), offline.extractor, offline.answerer)
}

/// Judge that never answers within a test's lifetime
pub struct StalledJudge;

#[async_trait]
impl SemanticJudge for StalledJudge {
    async fn classify(&self, _candidate: &str, _existing: &str) -> Result<Judgment> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Judgment::Equivalent)
    }
}
