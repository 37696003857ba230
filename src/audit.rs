//! Append-only audit log of reconciliation decisions and point-in-time replay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::memory::MemoryRecord;
use crate::storage::{RecordStore, VectorIndex};

/// Action taken for one candidate fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Add,
    Update,
    Delete,
    None,
}

impl AuditAction {
    /// Convert to string for SQLite storage
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Add => "ADD",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::None => "NONE",
        }
    }

    /// Parse from SQLite string
    pub fn from_str_value(s: &str) -> Result<Self> {
        match s {
            "ADD" => Ok(AuditAction::Add),
            "UPDATE" => Ok(AuditAction::Update),
            "DELETE" => Ok(AuditAction::Delete),
            "NONE" => Ok(AuditAction::None),
            _ => Err(Error::storage(format!("Unknown audit action: {}", s))),
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied decision. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Persona namespace
    pub persona_id: String,

    /// Position in the persona's log, starting at 1, without gaps
    pub sequence_no: u64,

    pub action: AuditAction,

    /// Record the decision touched or matched, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Uuid>,

    /// Record before the decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_snapshot: Option<MemoryRecord>,

    /// Record after the decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_snapshot: Option<MemoryRecord>,

    pub timestamp: DateTime<Utc>,

    /// The candidate fact that triggered the decision
    pub candidate_text: String,

    /// Why the candidate was not applied, for failed candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    /// Whether this entry records a failed candidate
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// An audit entry that has not been assigned a sequence number yet
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry {
    pub action: AuditAction,
    pub record_id: Option<Uuid>,
    pub before: Option<MemoryRecord>,
    pub after: Option<MemoryRecord>,
    pub error: Option<String>,
}

impl PendingEntry {
    pub fn added(after: MemoryRecord) -> Self {
        Self {
            action: AuditAction::Add,
            record_id: Some(after.id),
            before: None,
            after: Some(after),
            error: None,
        }
    }

    pub fn changed(action: AuditAction, before: MemoryRecord, after: MemoryRecord) -> Self {
        Self {
            action,
            record_id: Some(after.id),
            before: Some(before),
            after: Some(after),
            error: None,
        }
    }

    pub fn observed(record_id: Option<Uuid>, error: Option<String>) -> Self {
        Self {
            action: AuditAction::None,
            record_id,
            before: None,
            after: None,
            error,
        }
    }

    pub fn seal(
        self,
        persona_id: &str,
        sequence_no: u64,
        timestamp: DateTime<Utc>,
        candidate_text: &str,
    ) -> AuditEntry {
        AuditEntry {
            persona_id: persona_id.to_string(),
            sequence_no,
            action: self.action,
            record_id: self.record_id,
            before_snapshot: self.before,
            after_snapshot: self.after,
            timestamp,
            candidate_text: candidate_text.to_string(),
            error: self.error,
        }
    }
}

/// Store and index state reconstructed from an audit log prefix
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub store: RecordStore,
    pub index: VectorIndex,

    /// Last sequence number folded into this snapshot
    pub sequence_no: u64,
}

impl Snapshot {
    /// Contents of the active records, in insertion order
    pub fn active_contents(&self) -> Vec<String> {
        self.store.list_active().map(|r| r.content.clone()).collect()
    }
}

/// Rebuild store and index by folding entries `1..=upto` in order.
///
/// ADD, UPDATE and DELETE set the record to its after-snapshot; NONE entries
/// leave state untouched. The result depends only on the log prefix.
pub fn replay<'a>(
    entries: impl IntoIterator<Item = &'a AuditEntry>,
    upto: u64,
    dimensions: usize,
) -> Result<Snapshot> {
    let mut store = RecordStore::new();
    let mut last = 0;

    for entry in entries {
        if entry.sequence_no > upto {
            break;
        }
        if entry.sequence_no != last + 1 {
            return Err(Error::storage(format!(
                "audit log for '{}' skips from #{} to #{}",
                entry.persona_id, last, entry.sequence_no
            )));
        }
        last = entry.sequence_no;

        match (entry.action, &entry.after_snapshot) {
            (AuditAction::None, _) => {}
            (_, Some(after)) => store.put(after.clone()),
            (action, None) => {
                return Err(Error::storage(format!(
                    "{} entry #{} has no after-snapshot",
                    action, entry.sequence_no
                )));
            }
        }
    }

    let index = VectorIndex::from_records(dimensions, store.list_active())?;

    Ok(Snapshot {
        store,
        index,
        sequence_no: last,
    })
}
