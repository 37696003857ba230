//! Long-term memory records and the per-persona memory engine

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEntry, Snapshot};
use crate::config::Config;
use crate::embedding::{HashingEmbedder, TokenCounter};
use crate::error::{Error, Port, Result};
use crate::ports::{
    self, AnswerGenerator, Embedder, ExtractiveAnswerer, FactExtractor, SemanticJudge,
    SentenceExtractor,
};
use crate::reconciler::Reconciler;
use crate::retrieval::{RankedContext, RetrievedHit, Retriever};
use crate::short_term::{ShortTermBuffer, ShortTermEntry};
use crate::storage::{Namespace, SqliteStorage};

/// Lifecycle state of a memory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    /// Visible to retrieval and reconciliation
    Active,

    /// Tombstoned: kept for audit and rollback only
    Deleted,
}

impl RecordState {
    /// Convert to string for SQLite storage
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Active => "ACTIVE",
            RecordState::Deleted => "DELETED",
        }
    }

    /// Parse from SQLite string
    pub fn from_str_value(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(RecordState::Active),
            "DELETED" => Ok(RecordState::Deleted),
            _ => Err(Error::storage(format!("Unknown record state: {}", s))),
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fact held in long-term memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique record ID, never reused within a persona
    pub id: Uuid,

    /// Persona namespace this record belongs to
    pub persona_id: String,

    /// Canonical text of the fact
    pub content: String,

    /// Embedding of `content`, produced at write time
    pub embedding: Vec<f32>,

    /// When the record was created
    pub created_at: DateTime<Utc>,

    /// When the record was last changed
    pub updated_at: DateTime<Utc>,

    /// Lifecycle state
    pub state: RecordState,

    /// Incremented on every change; used for optimistic concurrency
    pub version: u64,
}

impl MemoryRecord {
    /// Create a new active record at version 1
    pub fn new(
        persona_id: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            persona_id: persona_id.into(),
            content: content.into(),
            embedding,
            created_at: now,
            updated_at: now,
            state: RecordState::Active,
            version: 1,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == RecordState::Active
    }

    /// Next version of this record with new content
    pub(crate) fn revised(&self, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            content: content.into(),
            embedding,
            updated_at: later_than(self.updated_at),
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// Next version of this record, tombstoned
    pub(crate) fn tombstoned(&self) -> Self {
        Self {
            state: RecordState::Deleted,
            updated_at: later_than(self.updated_at),
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// Next version of this record carrying the content and state of `target`
    pub(crate) fn restored_to(&self, target: &MemoryRecord) -> Self {
        Self {
            content: target.content.clone(),
            embedding: target.embedding.clone(),
            state: target.state,
            updated_at: later_than(self.updated_at),
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// Whether two versions of a record state the same thing
    pub(crate) fn same_substance(&self, other: &MemoryRecord) -> bool {
        self.content == other.content
            && self.state == other.state
            && self.embedding == other.embedding
    }
}

/// Wall-clock now, but never earlier than `previous`
fn later_than(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}

/// The external collaborators wired into an engine
#[derive(Clone)]
pub struct Ports {
    pub embedder: Arc<dyn Embedder>,
    pub extractor: Arc<dyn FactExtractor>,
    pub judge: Option<Arc<dyn SemanticJudge>>,
    pub answerer: Arc<dyn AnswerGenerator>,
}

impl Ports {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn FactExtractor>,
        answerer: Arc<dyn AnswerGenerator>,
    ) -> Self {
        Self {
            embedder,
            extractor,
            judge: None,
            answerer,
        }
    }

    /// Delegate equivalence/refinement/contradiction to a semantic judge
    pub fn with_judge(mut self, judge: Arc<dyn SemanticJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Built-in adapters that need no model or network
    pub fn offline(dimensions: usize) -> Self {
        Self::new(
            Arc::new(HashingEmbedder::new(dimensions)),
            Arc::new(SentenceExtractor),
            Arc::new(ExtractiveAnswerer::default()),
        )
    }
}

/// Answer to a question with the context it was generated from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,

    /// Context handed to the answer port, in citation order
    pub sources: Vec<RetrievedHit>,

    pub context_tokens: u32,
}

/// Everything the engine holds for one persona
struct PersonaSlot {
    namespace: Arc<Namespace>,
    short_term: Mutex<ShortTermBuffer>,

    /// Serializes reconciliation batches of this persona
    writer: AsyncMutex<()>,
}

impl PersonaSlot {
    fn short_term(&self) -> Result<std::sync::MutexGuard<'_, ShortTermBuffer>> {
        self.short_term
            .lock()
            .map_err(|e| Error::storage(e.to_string()))
    }
}

/// Per-persona memory reconciliation and retrieval engine
pub struct MemoryEngine {
    config: Config,
    storage: Arc<SqliteStorage>,
    ports: Ports,
    reconciler: Reconciler,
    retriever: Retriever,
    token_counter: TokenCounter,
    personas: RwLock<HashMap<String, Arc<PersonaSlot>>>,
}

impl MemoryEngine {
    /// Open the engine on the SQLite database under `config.data_dir`
    pub async fn open(config: Config, ports: Ports) -> Result<Self> {
        let storage = Arc::new(SqliteStorage::new(&config)?);
        Self::with_storage(config, ports, storage)
    }

    /// Engine backed by a private in-memory database
    pub async fn in_memory(config: Config, ports: Ports) -> Result<Self> {
        let storage = Arc::new(SqliteStorage::open_in_memory()?);
        Self::with_storage(config, ports, storage)
    }

    fn with_storage(config: Config, ports: Ports, storage: Arc<SqliteStorage>) -> Result<Self> {
        config.validate()?;
        if ports.embedder.dimensions() != config.embedding_dimensions {
            return Err(Error::config(format!(
                "embedder produces {} dimensions, config expects {}",
                ports.embedder.dimensions(),
                config.embedding_dimensions
            )));
        }

        let mut personas = HashMap::new();
        for persona in storage.personas()? {
            let slot = Self::new_slot(&config, &storage, &persona);
            personas.insert(persona, slot);
        }

        info!(
            personas = personas.len(),
            dimensions = config.embedding_dimensions,
            "Memory engine ready"
        );

        Ok(Self {
            reconciler: Reconciler::new(&config, ports.judge.clone()),
            retriever: Retriever::new(&config),
            token_counter: TokenCounter::for_gpt()?,
            personas: RwLock::new(personas),
            config,
            storage,
            ports,
        })
    }

    fn new_slot(config: &Config, storage: &Arc<SqliteStorage>, persona: &str) -> Arc<PersonaSlot> {
        Arc::new(PersonaSlot {
            namespace: Arc::new(Namespace::load(
                persona,
                storage.clone(),
                config.embedding_dimensions,
            )),
            short_term: Mutex::new(ShortTermBuffer::new(persona, config.short_term_capacity)),
            writer: AsyncMutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Slot of a persona, created on first write
    async fn slot(&self, persona: &str) -> Result<Arc<PersonaSlot>> {
        if persona.trim().is_empty() {
            return Err(Error::invalid_input("persona id must not be empty"));
        }

        if let Some(slot) = self.personas.read().await.get(persona) {
            return Ok(slot.clone());
        }

        let mut personas = self.personas.write().await;
        let slot = personas
            .entry(persona.to_string())
            .or_insert_with(|| {
                debug!(persona = %persona, "Creating namespace");
                Self::new_slot(&self.config, &self.storage, persona)
            })
            .clone();
        Ok(slot)
    }

    async fn existing(&self, persona: &str) -> Option<Arc<PersonaSlot>> {
        self.personas.read().await.get(persona).cloned()
    }

    async fn existing_or_not_found(&self, persona: &str) -> Result<Arc<PersonaSlot>> {
        self.existing(persona)
            .await
            .ok_or_else(|| Error::not_found(format!("persona '{}'", persona)))
    }

    async fn embed(&self, text: &str, persona: &str) -> Result<Vec<f32>> {
        ports::call(
            Port::Embedding,
            self.config.port_timeout(),
            self.ports.embedder.embed(text, persona),
        )
        .await
    }

    /// Record a message and reconcile the facts extracted from it
    pub async fn add_message(&self, persona: &str, text: &str) -> Result<Vec<AuditEntry>> {
        self.add_message_with(persona, text, true).await
    }

    /// Record a message; with `infer == false` the message itself is the only candidate
    pub async fn add_message_with(
        &self,
        persona: &str,
        text: &str,
        infer: bool,
    ) -> Result<Vec<AuditEntry>> {
        if text.trim().is_empty() {
            return Err(Error::invalid_input("message must not be empty"));
        }
        let slot = self.slot(persona).await?;

        // The message stays in short-term memory even if the embedder is down
        let message_embedding = match self.embed(text, persona).await {
            Ok(embedding) => Some(embedding),
            Err(error) => {
                warn!(
                    persona = %persona,
                    error = %error,
                    "Message kept in short-term memory without embedding"
                );
                None
            }
        };
        let recent_context = {
            let mut buffer = slot.short_term()?;
            buffer.record(text, message_embedding);
            buffer.texts(1)
        };

        let facts = if infer {
            let extracted = ports::call(
                Port::Extraction,
                self.config.port_timeout(),
                self.ports.extractor.extract(text, &recent_context),
            )
            .await;
            match extracted {
                Ok(facts) => facts,
                Err(error) => {
                    let _writer = slot.writer.lock().await;
                    self.reconciler.record_error(&slot.namespace, text, &error, None)?;
                    return Err(error);
                }
            }
        } else {
            vec![text.to_string()]
        };

        self.reconcile_batch(&slot, persona, facts).await
    }

    /// Reconcile an ordered batch of already extracted facts
    pub async fn add_facts(&self, persona: &str, facts: Vec<String>) -> Result<Vec<AuditEntry>> {
        let slot = self.slot(persona).await?;
        self.reconcile_batch(&slot, persona, facts).await
    }

    async fn reconcile_batch(
        &self,
        slot: &PersonaSlot,
        persona: &str,
        facts: Vec<String>,
    ) -> Result<Vec<AuditEntry>> {
        let facts: Vec<String> = facts
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if facts.is_empty() {
            return Ok(Vec::new());
        }

        // Embeddings are computed before taking the write lock
        let embeddings = join_all(facts.iter().map(|fact| self.embed(fact, persona))).await;

        let _writer = slot.writer.lock().await;
        let mut entries = Vec::new();
        for (fact, embedding) in facts.iter().zip(embeddings) {
            let applied = self
                .reconciler
                .reconcile(&slot.namespace, fact, embedding)
                .await?;
            entries.extend(applied);
        }

        info!(
            persona = %persona,
            candidates = facts.len(),
            entries = entries.len(),
            "Reconciled batch"
        );

        Ok(entries)
    }

    /// Top-`k` hits for a query, long-term and short-term merged
    pub async fn search(&self, persona: &str, query: &str, k: usize) -> Result<Vec<RetrievedHit>> {
        self.search_with_threshold(persona, query, k, None).await
    }

    /// Like [`MemoryEngine::search`], with a long-term score floor for this call only
    pub async fn search_with_threshold(
        &self,
        persona: &str,
        query: &str,
        k: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<RetrievedHit>> {
        Ok(self.retrieve_with_threshold(persona, query, k, threshold).await?.hits)
    }

    /// Ranked, source-tagged context for a query
    pub async fn retrieve(&self, persona: &str, query: &str, k: usize) -> Result<RankedContext> {
        self.retrieve_with_threshold(persona, query, k, None).await
    }

    async fn retrieve_with_threshold(
        &self,
        persona: &str,
        query: &str,
        k: usize,
        threshold: Option<f32>,
    ) -> Result<RankedContext> {
        let custom;
        let retriever = match threshold {
            Some(t) if !t.is_finite() => {
                return Err(Error::invalid_input(format!("threshold {} is not a number", t)));
            }
            Some(t) => {
                custom = self.retriever.with_min_score(t);
                &custom
            }
            None => &self.retriever,
        };

        let Some(slot) = self.existing(persona).await else {
            return Ok(RankedContext::empty());
        };
        if k == 0 {
            return Ok(RankedContext::empty());
        }

        let query_embedding = self.embed(query, persona).await?;
        let long_term = slot.namespace.search(&query_embedding, k)?;

        let buffer = slot.short_term()?;
        let context = retriever.rank(query, &query_embedding, long_term, buffer.recent(), k);
        Ok(context)
    }

    /// Retrieve, fit the context into the token budget and ask the answer port
    pub async fn answer(&self, persona: &str, question: &str, k: usize) -> Result<Answer> {
        let mut context = self.retrieve(persona, question, k).await?;
        let context_tokens = context.fit_to_budget(&self.token_counter, self.config.max_context_tokens);

        let text = ports::call(
            Port::Answer,
            self.config.port_timeout(),
            self.ports.answerer.generate(question, &context.hits),
        )
        .await?;

        Ok(Answer {
            text,
            sources: context.hits,
            context_tokens,
        })
    }

    /// Bring a persona back to its state after entry `upto_sequence`.
    ///
    /// The log is not truncated: compensating entries are appended.
    pub async fn rollback(&self, persona: &str, upto_sequence: u64) -> Result<Vec<AuditEntry>> {
        let slot = self.existing_or_not_found(persona).await?;
        let _writer = slot.writer.lock().await;

        let decision = slot.namespace.rollback_decision(upto_sequence)?;
        let entries = slot.namespace.apply(decision)?;

        info!(
            persona = %persona,
            upto = upto_sequence,
            compensating = entries.len(),
            "Rolled back"
        );

        Ok(entries)
    }

    /// Tombstone every active record and clear the short-term buffer.
    ///
    /// The tombstones are one decision in the audit log, so a rollback can undo it.
    pub async fn reset(&self, persona: &str) -> Result<Vec<AuditEntry>> {
        let slot = self.existing_or_not_found(persona).await?;
        let _writer = slot.writer.lock().await;

        let decision = slot.namespace.reset_decision()?;
        let entries = slot.namespace.apply(decision)?;
        let cleared = slot.short_term()?.clear();

        info!(
            persona = %persona,
            tombstoned = entries.len(),
            cleared,
            "Reset persona"
        );

        Ok(entries)
    }

    /// Store and index as they were after entry `upto_sequence`
    pub fn replay(&self, persona: &str, upto_sequence: u64) -> Result<Snapshot> {
        let entries = self.storage.audit_entries(persona, Some(upto_sequence))?;
        audit::replay(&entries, upto_sequence, self.config.embedding_dimensions)
    }

    /// Check the persona's index and store against each other and SQLite
    pub async fn verify(&self, persona: &str) -> Result<()> {
        self.existing_or_not_found(persona).await?.namespace.verify()
    }

    /// Rebuild a persona from its audit log; returns the active record count
    pub async fn rebuild(&self, persona: &str) -> Result<usize> {
        let slot = self.existing_or_not_found(persona).await?;
        let _writer = slot.writer.lock().await;
        slot.namespace.rebuild()
    }

    pub async fn get_record(&self, persona: &str, id: Uuid) -> Result<MemoryRecord> {
        self.existing_or_not_found(persona).await?.namespace.get(id)
    }

    /// Active records in insertion order; empty for unknown personas
    pub async fn list_active(&self, persona: &str) -> Result<Vec<MemoryRecord>> {
        match self.existing(persona).await {
            Some(slot) => slot.namespace.list_active(),
            None => Ok(Vec::new()),
        }
    }

    /// Ids held by the persona's vector index, sorted
    pub async fn indexed_ids(&self, persona: &str) -> Result<Vec<Uuid>> {
        match self.existing(persona).await {
            Some(slot) => slot.namespace.indexed_ids(),
            None => Ok(Vec::new()),
        }
    }

    /// Audit entries in sequence order, optionally up to `upto`
    pub fn audit_log(&self, persona: &str, upto: Option<u64>) -> Result<Vec<AuditEntry>> {
        self.storage.audit_entries(persona, upto)
    }

    /// Short-term entries oldest to newest
    pub async fn short_term(&self, persona: &str) -> Result<Vec<ShortTermEntry>> {
        let Some(slot) = self.existing(persona).await else {
            return Ok(Vec::new());
        };
        let entries = slot.short_term()?.recent().cloned().collect();
        Ok(entries)
    }

    /// Known personas, sorted
    pub async fn personas(&self) -> Vec<String> {
        let mut names: Vec<String> = self.personas.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;

    const DIMS: usize = 384;

    async fn engine() -> MemoryEngine {
        MemoryEngine::in_memory(Config::default(), Ports::offline(DIMS))
            .await
            .unwrap()
    }

    #[test]
    fn new_record_starts_active_at_version_one() {
        let record = MemoryRecord::new("p1", "User owns a dog", vec![1.0]);
        assert!(record.is_active());
        assert_eq!(record.version, 1);
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn record_transitions_bump_version() {
        let record = MemoryRecord::new("p1", "a", vec![1.0]);
        let dead = record.tombstoned();
        assert_eq!(dead.version, 2);
        assert_eq!(dead.state, RecordState::Deleted);
        assert_eq!(dead.id, record.id);

        let back = dead.restored_to(&record);
        assert_eq!(back.version, 3);
        assert!(back.is_active());
        assert!(back.same_substance(&record));
        assert!(back.updated_at >= dead.updated_at);
    }

    #[test]
    fn record_state_strings() {
        assert_eq!(RecordState::from_str_value("ACTIVE").unwrap(), RecordState::Active);
        assert!(RecordState::from_str_value("GONE").is_err());
        assert_eq!(serde_json::to_string(&RecordState::Deleted).unwrap(), "\"DELETED\"");
    }

    #[tokio::test]
    async fn rejects_mismatched_embedder() {
        let result = MemoryEngine::in_memory(Config::default(), Ports::offline(16)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn message_lands_in_short_term_even_without_facts() {
        let engine = engine().await;
        let entries = engine.add_message("p1", "What food do I like?").await.unwrap();

        assert!(entries.is_empty());
        let recent = engine.short_term("p1").await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "stm-1");
        assert!(engine.list_active("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn raw_message_mode_skips_extraction() {
        let engine = engine().await;
        let entries = engine
            .add_message_with("p1", "Favourite food is sushi. Also ramen.", false)
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Add);
        assert_eq!(entries[0].candidate_text, "Favourite food is sushi. Also ramen.");
    }

    #[tokio::test]
    async fn empty_inputs_are_rejected() {
        let engine = engine().await;
        assert!(matches!(engine.add_message("p1", "  ").await, Err(Error::InvalidInput(_))));
        assert!(matches!(engine.add_message("", "hi").await, Err(Error::InvalidInput(_))));
        assert!(engine.add_facts("p1", vec![" ".into()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_persona_reads_are_empty() {
        let engine = engine().await;
        assert!(engine.search("ghost", "anything", 3).await.unwrap().is_empty());
        assert!(engine.list_active("ghost").await.unwrap().is_empty());
        assert!(matches!(engine.rollback("ghost", 0).await, Err(Error::NotFound(_))));
        assert!(engine.personas().await.is_empty());
    }

    #[tokio::test]
    async fn answer_cites_sources_within_budget() {
        let engine = engine().await;
        engine.add_message("p1", "Favourite food is sushi").await.unwrap();

        let answer = engine.answer("p1", "What food do I like?", 3).await.unwrap();
        assert!(answer.text.contains("Favourite food is sushi [1]"));
        assert_eq!(answer.sources.len(), 1);
        assert!(answer.sources[0].is_long_term());
        assert!(answer.context_tokens > 0);
        assert!(answer.context_tokens <= engine.config().max_context_tokens);
    }

    #[tokio::test]
    async fn reset_empties_persona_and_rolls_back() {
        let engine = engine().await;
        engine
            .add_facts("p1", vec!["User owns a dog".into(), "User plays chess".into()])
            .await
            .unwrap();
        engine.add_message("p1", "What food do I like?").await.unwrap();

        let entries = engine.reset("p1").await.unwrap();
        let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Delete, AuditAction::Delete]);
        assert!(engine.list_active("p1").await.unwrap().is_empty());
        assert!(engine.indexed_ids("p1").await.unwrap().is_empty());
        assert!(engine.short_term("p1").await.unwrap().is_empty());

        engine.rollback("p1", 2).await.unwrap();
        assert_eq!(engine.list_active("p1").await.unwrap().len(), 2);
        assert!(matches!(engine.reset("ghost").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn per_call_threshold_overrides_floor() {
        let engine = engine().await;
        engine
            .add_facts("p1", vec!["Favourite food is sushi".into()])
            .await
            .unwrap();

        let question = "What food do I like?";
        let loose = engine.search_with_threshold("p1", question, 3, None).await.unwrap();
        assert_eq!(loose.len(), 1);

        let strict = engine.search_with_threshold("p1", question, 3, Some(0.9)).await.unwrap();
        assert!(strict.is_empty());

        let nan = engine.search_with_threshold("p1", question, 3, Some(f32::NAN)).await;
        assert!(matches!(nan, Err(Error::InvalidInput(_))));
    }
}
