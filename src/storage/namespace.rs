//! The record store and vector index of one persona, updated as one unit.
//!
//! Every mutation goes through [`Namespace::apply`]: the steps of a decision
//! are staged on both structures under one write lock, committed to SQLite in
//! one transaction, and undone in memory if anything fails. Readers take the
//! read lock and therefore never see a record without its index entry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditAction, AuditEntry, PendingEntry};
use crate::error::{Error, Result};
use crate::memory::MemoryRecord;
use crate::storage::{RecordStore, SqliteStorage, VectorIndex};
use crate::text;

/// One mutation inside a decision
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Insert a new active record
    Add(MemoryRecord),

    /// Replace content and embedding of an active record
    Update {
        id: Uuid,
        expected_version: u64,
        content: String,
        embedding: Vec<f32>,
    },

    /// Tombstone an active record
    Delete { id: Uuid, expected_version: u64 },

    /// Bring a record back to the content and state of an earlier version
    Restore {
        id: Uuid,
        expected_version: u64,
        target: MemoryRecord,
    },

    /// No mutation; only the audit entry is written
    Observe {
        record_id: Option<Uuid>,
        error: Option<String>,
    },
}

/// The all-or-nothing unit applied for one candidate fact
#[derive(Debug, Clone)]
pub(crate) struct Decision {
    pub candidate_text: String,
    pub steps: Vec<Step>,
}

impl Decision {
    pub fn new(candidate_text: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            candidate_text: candidate_text.into(),
            steps,
        }
    }

    pub fn single(candidate_text: impl Into<String>, step: Step) -> Self {
        Self::new(candidate_text, vec![step])
    }
}

struct PersonaState {
    store: RecordStore,
    index: VectorIndex,
    last_sequence: u64,

    /// Set when a divergence was detected; cleared by `rebuild`
    poisoned: Option<String>,
}

/// Previous value of a record touched by a staged step
struct Undo {
    before: Option<MemoryRecord>,
    after: MemoryRecord,
}

impl PersonaState {
    fn stage(&mut self, step: Step, journal: &mut Vec<Undo>) -> Result<PendingEntry> {
        match step {
            Step::Add(record) => {
                self.index.check_embedding(&record.embedding)?;
                if self.store.contains(record.id) {
                    return Err(Error::storage(format!("record {} already exists", record.id)));
                }
                self.store.put(record.clone());
                journal.push(Undo {
                    before: None,
                    after: record.clone(),
                });
                self.index.upsert(record.id, &record.embedding)?;
                Ok(PendingEntry::added(record))
            }
            Step::Update {
                id,
                expected_version,
                content,
                embedding,
            } => {
                self.index.check_embedding(&embedding)?;
                let before = self.store.check_version(id, expected_version)?.clone();
                let after = self.store.revise(id, expected_version, &content, embedding)?;
                journal.push(Undo {
                    before: Some(before.clone()),
                    after: after.clone(),
                });
                self.index.upsert(id, &after.embedding)?;
                Ok(PendingEntry::changed(AuditAction::Update, before, after))
            }
            Step::Delete {
                id,
                expected_version,
            } => {
                let before = self.store.check_version(id, expected_version)?.clone();
                if !before.is_active() {
                    return Err(Error::not_found(format!("active record {}", id)));
                }
                let after = self.store.tombstone(id, expected_version)?;
                journal.push(Undo {
                    before: Some(before.clone()),
                    after: after.clone(),
                });
                self.index.remove(id);
                Ok(PendingEntry::changed(AuditAction::Delete, before, after))
            }
            Step::Restore {
                id,
                expected_version,
                target,
            } => {
                if target.is_active() {
                    self.index.check_embedding(&target.embedding)?;
                }
                let before = self.store.check_version(id, expected_version)?.clone();
                let after = before.restored_to(&target);
                self.store.put(after.clone());
                journal.push(Undo {
                    before: Some(before.clone()),
                    after: after.clone(),
                });
                let action = if after.is_active() {
                    self.index.upsert(id, &after.embedding)?;
                    AuditAction::Update
                } else {
                    self.index.remove(id);
                    AuditAction::Delete
                };
                Ok(PendingEntry::changed(action, before, after))
            }
            Step::Observe { record_id, error } => Ok(PendingEntry::observed(record_id, error)),
        }
    }

    fn undo(&mut self, journal: Vec<Undo>) {
        for Undo { before, after } in journal.into_iter().rev() {
            match before {
                Some(before) => {
                    if before.is_active() {
                        // Dimensions were valid when this record was staged
                        let _ = self.index.upsert(before.id, &before.embedding);
                    } else {
                        self.index.remove(before.id);
                    }
                    self.store.put(before);
                }
                None => {
                    self.store.remove(after.id);
                    self.index.remove(after.id);
                }
            }
        }
    }

    /// Describe how the index and the active records disagree, if they do
    fn divergence(&self) -> Option<String> {
        let indexed: HashSet<Uuid> = self.index.ids().collect();
        let active: HashSet<Uuid> = self.store.list_active().map(|r| r.id).collect();

        if indexed == active {
            return None;
        }

        let missing = active.difference(&indexed).count();
        let stale = indexed.difference(&active).count();
        Some(format!(
            "{} active records missing from the index, {} index entries without an active record",
            missing, stale
        ))
    }
}

/// Store and index of a single persona
pub struct Namespace {
    persona: String,
    storage: Arc<SqliteStorage>,
    state: RwLock<PersonaState>,
}

impl Namespace {
    /// Load a persona from durable storage and rebuild its index.
    ///
    /// A persona whose records cannot be loaded comes up poisoned instead of
    /// failing, so other personas stay usable.
    pub fn load(persona: &str, storage: Arc<SqliteStorage>, dimensions: usize) -> Self {
        let loaded = storage.load_records(persona).and_then(|records| {
            let store = RecordStore::from_records(records);
            let index = VectorIndex::from_records(dimensions, store.list_active())?;
            let last_sequence = storage.last_sequence(persona)?;
            Ok((store, index, last_sequence))
        });

        let state = match loaded {
            Ok((store, index, last_sequence)) => {
                debug!(
                    persona = %persona,
                    records = store.len(),
                    indexed = index.size(),
                    sequence_no = last_sequence,
                    "Loaded namespace"
                );
                PersonaState {
                    store,
                    index,
                    last_sequence,
                    poisoned: None,
                }
            }
            Err(e) => {
                warn!(persona = %persona, error = %e, "Namespace failed to load; rebuild required");
                PersonaState {
                    store: RecordStore::new(),
                    index: VectorIndex::new(dimensions),
                    last_sequence: 0,
                    poisoned: Some(format!("failed to load: {}", e)),
                }
            }
        };

        Self {
            persona: persona.to_string(),
            storage,
            state: RwLock::new(state),
        }
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, PersonaState>> {
        let state = self.state.read().map_err(|e| Error::storage(e.to_string()))?;
        self.healthy(&state)?;
        Ok(state)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, PersonaState>> {
        self.state.write().map_err(|e| Error::storage(e.to_string()))
    }

    fn healthy(&self, state: &PersonaState) -> Result<()> {
        match &state.poisoned {
            Some(detail) => Err(Error::consistency(&self.persona, detail.clone())),
            None => Ok(()),
        }
    }

    /// Apply every step of a decision, or none of them.
    ///
    /// Returns the sealed audit entries, one per step, with consecutive
    /// sequence numbers.
    pub(crate) fn apply(&self, decision: Decision) -> Result<Vec<AuditEntry>> {
        if decision.steps.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.write()?;
        self.healthy(&state)?;

        let mut journal = Vec::with_capacity(decision.steps.len());
        let mut pending = Vec::with_capacity(decision.steps.len());
        for step in decision.steps {
            match state.stage(step, &mut journal) {
                Ok(entry) => pending.push(entry),
                Err(e) => {
                    state.undo(journal);
                    return Err(e);
                }
            }
        }

        let timestamp = Utc::now();
        let first = state.last_sequence + 1;
        let entries: Vec<AuditEntry> = pending
            .into_iter()
            .zip(first..)
            .map(|(entry, seq)| entry.seal(&self.persona, seq, timestamp, &decision.candidate_text))
            .collect();
        let records: Vec<MemoryRecord> = journal.iter().map(|u| u.after.clone()).collect();

        if let Err(e) = self.storage.commit(&self.persona, &records, &entries) {
            warn!(persona = %self.persona, error = %e, "Commit failed; decision undone");
            state.undo(journal);
            return Err(e);
        }

        state.last_sequence += entries.len() as u64;
        for entry in &entries {
            debug!(
                persona = %self.persona,
                sequence_no = entry.sequence_no,
                action = %entry.action,
                record_id = ?entry.record_id,
                "Applied"
            );
        }

        Ok(entries)
    }

    /// Top-`k` active records by similarity, read under one lock
    pub fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<(MemoryRecord, f32)>> {
        let state = self.read()?;

        state
            .index
            .search(embedding, k)?
            .into_iter()
            .map(|(id, score)| {
                let record = state.store.get(id)?;
                if !record.is_active() {
                    return Err(Error::consistency(
                        &self.persona,
                        format!("index holds tombstoned record {}", id),
                    ));
                }
                Ok((record.clone(), score))
            })
            .collect()
    }

    /// Current version of a record, tombstones included
    pub fn get(&self, id: Uuid) -> Result<MemoryRecord> {
        self.read()?.store.get(id).cloned()
    }

    /// Active records in insertion order
    pub fn list_active(&self) -> Result<Vec<MemoryRecord>> {
        Ok(self.read()?.store.list_active().cloned().collect())
    }

    /// Active record stating `content` verbatim, ignoring case and punctuation
    pub fn find_verbatim(&self, content: &str) -> Result<Option<MemoryRecord>> {
        let wanted = text::normalize(content);
        if wanted.is_empty() {
            return Ok(None);
        }
        Ok(self
            .read()?
            .store
            .list_active()
            .find(|r| text::normalize(&r.content) == wanted)
            .cloned())
    }

    /// All records including tombstones, in insertion order
    pub fn records(&self) -> Result<Vec<MemoryRecord>> {
        Ok(self.read()?.store.iter().cloned().collect())
    }

    /// Ids held by the vector index, sorted
    pub fn indexed_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.read()?.index.ids().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn last_sequence(&self) -> Result<u64> {
        Ok(self.read()?.last_sequence)
    }

    pub fn is_poisoned(&self) -> bool {
        self.state
            .read()
            .map(|state| state.poisoned.is_some())
            .unwrap_or(true)
    }

    /// Compensating steps that bring the current state back to `upto`
    pub(crate) fn rollback_decision(&self, upto: u64) -> Result<Decision> {
        let head = self.last_sequence()?;
        if upto > head {
            return Err(Error::invalid_input(format!(
                "cannot roll back to #{}: log for '{}' ends at #{}",
                upto, self.persona, head
            )));
        }

        let entries = self.storage.audit_entries(&self.persona, Some(upto))?;
        let state = self.read()?;
        let target = audit::replay(&entries, upto, state.index.dimensions())?;

        let mut steps = Vec::new();
        for current in state.store.iter() {
            match target.store.get(current.id) {
                Ok(then) if !current.same_substance(then) => steps.push(Step::Restore {
                    id: current.id,
                    expected_version: current.version,
                    target: then.clone(),
                }),
                Ok(_) => {}
                Err(_) if current.is_active() => steps.push(Step::Delete {
                    id: current.id,
                    expected_version: current.version,
                }),
                Err(_) => {}
            }
        }
        for then in target.store.list_active() {
            if !state.store.contains(then.id) {
                steps.push(Step::Add(then.clone()));
            }
        }

        Ok(Decision::new(format!("rollback to #{}", upto), steps))
    }

    /// Tombstone every active record
    pub(crate) fn reset_decision(&self) -> Result<Decision> {
        let steps = self
            .read()?
            .store
            .list_active()
            .map(|r| Step::Delete {
                id: r.id,
                expected_version: r.version,
            })
            .collect();
        Ok(Decision::new("reset", steps))
    }

    /// Check the index against the store and the store against SQLite.
    ///
    /// On divergence the namespace is poisoned until [`Namespace::rebuild`].
    pub fn verify(&self) -> Result<()> {
        let mut state = self.write()?;
        self.healthy(&state)?;

        let mut detail = state.divergence();
        if detail.is_none() {
            let durable: HashMap<Uuid, MemoryRecord> = self
                .storage
                .load_records(&self.persona)?
                .into_iter()
                .map(|r| (r.id, r))
                .collect();
            let in_memory: HashMap<Uuid, MemoryRecord> =
                state.store.iter().map(|r| (r.id, r.clone())).collect();
            if durable != in_memory {
                detail = Some("durable records differ from the in-memory store".to_string());
            }
        }

        match detail {
            Some(detail) => {
                warn!(persona = %self.persona, detail = %detail, "Consistency violation");
                state.poisoned = Some(detail.clone());
                Err(Error::consistency(&self.persona, detail))
            }
            None => Ok(()),
        }
    }

    /// Reconstruct store, index and durable records by replaying the audit log.
    ///
    /// Returns the number of active records afterwards.
    pub fn rebuild(&self) -> Result<usize> {
        let mut state = self.write()?;
        let dimensions = state.index.dimensions();

        let entries = self.storage.audit_entries(&self.persona, None)?;
        let snapshot = audit::replay(&entries, u64::MAX, dimensions)?;
        self.storage.replace_records(&self.persona, snapshot.store.iter())?;

        let active = snapshot.store.active_count();
        *state = PersonaState {
            store: snapshot.store,
            index: snapshot.index,
            last_sequence: snapshot.sequence_no,
            poisoned: None,
        };

        info!(
            persona = %self.persona,
            active,
            sequence_no = state.last_sequence,
            "Rebuilt namespace from audit log"
        );

        Ok(active)
    }
}
