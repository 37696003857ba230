//! In-memory record store for one persona

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::memory::MemoryRecord;

/// Authoritative id -> record mapping for one persona.
///
/// Records keep their insertion order. Mutators are crate-private: outside
/// callers change records only through reconciliation decisions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordStore {
    records: HashMap<Uuid, MemoryRecord>,
    order: Vec<Uuid>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from records in insertion order
    pub fn from_records(records: impl IntoIterator<Item = MemoryRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.put(record);
        }
        store
    }

    /// Insert or replace by id
    pub(crate) fn put(&mut self, record: MemoryRecord) {
        if !self.records.contains_key(&record.id) {
            self.order.push(record.id);
        }
        self.records.insert(record.id, record);
    }

    /// Drop a record entirely; only used to undo an uncommitted insert
    pub(crate) fn remove(&mut self, id: Uuid) -> Option<MemoryRecord> {
        let removed = self.records.remove(&id)?;
        self.order.retain(|other| *other != id);
        Some(removed)
    }

    /// Get the current version of a record
    pub fn get(&self, id: Uuid) -> Result<&MemoryRecord> {
        self.records
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("record {}", id)))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.records.contains_key(&id)
    }

    /// Fail with `VersionConflict` unless the stored version is `expected`
    pub fn check_version(&self, id: Uuid, expected: u64) -> Result<&MemoryRecord> {
        let record = self.get(id)?;
        if record.version != expected {
            return Err(Error::VersionConflict {
                id,
                expected,
                actual: record.version,
            });
        }
        Ok(record)
    }

    /// Replace content and embedding of an active record
    pub(crate) fn revise(
        &mut self,
        id: Uuid,
        expected_version: u64,
        content: &str,
        embedding: Vec<f32>,
    ) -> Result<MemoryRecord> {
        let current = self.check_version(id, expected_version)?;
        if !current.is_active() {
            return Err(Error::not_found(format!("active record {}", id)));
        }
        let revised = current.revised(content, embedding);
        self.put(revised.clone());
        Ok(revised)
    }

    /// Tombstone a record, guarded by its expected version
    pub(crate) fn tombstone(&mut self, id: Uuid, expected_version: u64) -> Result<MemoryRecord> {
        let tombstoned = self.check_version(id, expected_version)?.tombstoned();
        self.put(tombstoned.clone());
        Ok(tombstoned)
    }

    /// Active records in insertion order.
    ///
    /// The iterator is lazy and `Clone`, so a consumer can restart it.
    pub fn list_active(&self) -> impl Iterator<Item = &MemoryRecord> + Clone + '_ {
        self.iter().filter(|r| r.is_active())
    }

    /// All records, tombstones included, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRecord> + Clone + '_ {
        self.order.iter().filter_map(move |id| self.records.get(id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.list_active().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordState;

    fn record(content: &str) -> MemoryRecord {
        MemoryRecord::new("p1", content, vec![1.0, 0.0])
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = RecordStore::new();
        assert!(matches!(store.get(Uuid::new_v4()), Err(Error::NotFound(_))));
    }

    #[test]
    fn list_active_keeps_insertion_order_and_restarts() {
        let mut store = RecordStore::new();
        let a = record("a");
        let b = record("b");
        let c = record("c");
        store.put(a.clone());
        store.put(b.clone());
        store.put(c.clone());
        store.tombstone(b.id, 1).unwrap();

        let active = store.list_active();
        let first: Vec<_> = active.clone().map(|r| r.content.as_str()).collect();
        let second: Vec<_> = active.map(|r| r.content.as_str()).collect();
        assert_eq!(first, vec!["a", "c"]);
        assert_eq!(first, second);
    }

    #[test]
    fn put_replaces_without_reordering() {
        let mut store = RecordStore::new();
        let a = record("a");
        let b = record("b");
        store.put(a.clone());
        store.put(b);
        store.put(a.revised("a2", vec![0.0, 1.0]));

        let contents: Vec<_> = store.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["a2", "b"]);
    }

    #[test]
    fn tombstone_checks_version() {
        let mut store = RecordStore::new();
        let a = record("a");
        store.put(a.clone());

        let err = store.tombstone(a.id, 7).unwrap_err();
        assert!(matches!(err, Error::VersionConflict { expected: 7, actual: 1, .. }));
        assert!(store.get(a.id).unwrap().is_active());

        let dead = store.tombstone(a.id, 1).unwrap();
        assert_eq!(dead.state, RecordState::Deleted);
        assert_eq!(dead.version, 2);
        assert!(dead.updated_at >= a.updated_at);
        assert_eq!(store.active_count(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn revise_bumps_version_and_rejects_tombstones() {
        let mut store = RecordStore::new();
        let a = record("a");
        store.put(a.clone());

        let revised = store.revise(a.id, 1, "a, refined", vec![0.5, 0.5]).unwrap();
        assert_eq!(revised.version, 2);
        assert_eq!(revised.created_at, a.created_at);

        store.tombstone(a.id, 2).unwrap();
        assert!(store.revise(a.id, 3, "again", vec![1.0, 0.0]).is_err());
    }

    #[test]
    fn remove_forgets_order() {
        let mut store = RecordStore::new();
        let a = record("a");
        store.put(a.clone());
        assert!(store.remove(a.id).is_some());
        assert!(store.is_empty());
        assert_eq!(store.iter().count(), 0);
    }
}
