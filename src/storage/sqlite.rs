//! SQLite persistence for memory records and the audit log

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::{MemoryRecord, RecordState};

/// SQLite storage backend shared by every persona namespace
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open the database under the configured data directory
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open(config.sqlite_path())
    }

    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Private in-memory database, gone when dropped
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    /// Every persona that has records or audit history
    pub fn personas(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT persona_id FROM records
            UNION
            SELECT persona_id FROM audit_log
            ORDER BY persona_id
            "#,
        )?;

        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Error::from)
    }

    /// All records of a persona, tombstones included, in insertion order
    pub fn load_records(&self, persona: &str) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, persona_id, content, embedding, state, version, created_at, updated_at
            FROM records WHERE persona_id = ?1
            ORDER BY rowid
            "#,
        )?;

        let rows = stmt.query_map(params![persona], |row| {
            Ok(RecordRow {
                id: row.get(0)?,
                persona_id: row.get(1)?,
                content: row.get(2)?,
                embedding: row.get(3)?,
                state: row.get(4)?,
                version: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }

        Ok(records)
    }

    /// Highest audit sequence number of a persona, 0 when the log is empty
    pub fn last_sequence(&self, persona: &str) -> Result<u64> {
        let conn = self.lock()?;

        let last: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_no), 0) FROM audit_log WHERE persona_id = ?1",
            params![persona],
            |row| row.get(0),
        )?;

        Ok(last as u64)
    }

    /// Audit entries of a persona in sequence order, optionally up to `upto`
    pub fn audit_entries(&self, persona: &str, upto: Option<u64>) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let upto = upto.map_or(i64::MAX, |s| s.min(i64::MAX as u64) as i64);

        let mut stmt = conn.prepare(
            r#"
            SELECT persona_id, sequence_no, action, record_id, before_snapshot,
                   after_snapshot, candidate_text, error, timestamp
            FROM audit_log
            WHERE persona_id = ?1 AND sequence_no <= ?2
            ORDER BY sequence_no
            "#,
        )?;

        let rows = stmt.query_map(params![persona, upto], |row| {
            Ok(AuditRow {
                persona_id: row.get(0)?,
                sequence_no: row.get(1)?,
                action: row.get(2)?,
                record_id: row.get(3)?,
                before_snapshot: row.get(4)?,
                after_snapshot: row.get(5)?,
                candidate_text: row.get(6)?,
                error: row.get(7)?,
                timestamp: row.get(8)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }

        Ok(entries)
    }

    /// Write the records and audit entries of one decision in a single transaction
    pub(crate) fn commit(
        &self,
        persona: &str,
        records: &[MemoryRecord],
        entries: &[AuditEntry],
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for record in records {
            upsert_record(&tx, persona, record)?;
        }

        for entry in entries {
            tx.execute(
                r#"
                INSERT INTO audit_log (
                    persona_id, sequence_no, action, record_id, before_snapshot,
                    after_snapshot, candidate_text, error, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    persona,
                    entry.sequence_no as i64,
                    entry.action.as_str(),
                    entry.record_id.map(|id| id.to_string()),
                    entry.before_snapshot.as_ref().map(serde_json::to_string).transpose()?,
                    entry.after_snapshot.as_ref().map(serde_json::to_string).transpose()?,
                    entry.candidate_text,
                    entry.error,
                    entry.timestamp.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Overwrite every record of a persona, keeping the given order
    pub(crate) fn replace_records<'a>(
        &self,
        persona: &str,
        records: impl IntoIterator<Item = &'a MemoryRecord>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM records WHERE persona_id = ?1", params![persona])?;
        for record in records {
            upsert_record(&tx, persona, record)?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn upsert_record(tx: &Transaction<'_>, persona: &str, record: &MemoryRecord) -> Result<()> {
    // Conflict update keeps the rowid, so insertion order survives revisions
    tx.execute(
        r#"
        INSERT INTO records (
            persona_id, id, content, embedding, state, version, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(persona_id, id) DO UPDATE SET
            content = excluded.content,
            embedding = excluded.embedding,
            state = excluded.state,
            version = excluded.version,
            updated_at = excluded.updated_at
        "#,
        params![
            persona,
            record.id.to_string(),
            record.content,
            vec_to_blob(&record.embedding),
            record.state.as_str(),
            record.version as i64,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Embeddings are stored as little-endian f32
fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::storage(format!(
            "embedding blob of {} bytes is not a whole number of f32",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::storage(e.to_string()))
}

/// Intermediate struct for reading records from SQLite
struct RecordRow {
    id: String,
    persona_id: String,
    content: String,
    embedding: Vec<u8>,
    state: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn into_record(self) -> Result<MemoryRecord> {
        Ok(MemoryRecord {
            id: parse_uuid(&self.id)?,
            persona_id: self.persona_id,
            content: self.content,
            embedding: blob_to_vec(&self.embedding)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            state: RecordState::from_str_value(&self.state)?,
            version: u64::try_from(self.version)
                .map_err(|_| Error::storage(format!("negative version {}", self.version)))?,
        })
    }
}

/// Intermediate struct for reading audit entries from SQLite
struct AuditRow {
    persona_id: String,
    sequence_no: i64,
    action: String,
    record_id: Option<String>,
    before_snapshot: Option<String>,
    after_snapshot: Option<String>,
    candidate_text: String,
    error: Option<String>,
    timestamp: String,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry> {
        Ok(AuditEntry {
            persona_id: self.persona_id,
            sequence_no: self.sequence_no as u64,
            action: AuditAction::from_str_value(&self.action)?,
            record_id: self.record_id.as_deref().map(parse_uuid).transpose()?,
            before_snapshot: self
                .before_snapshot
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            after_snapshot: self
                .after_snapshot
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            timestamp: parse_timestamp(&self.timestamp)?,
            candidate_text: self.candidate_text,
            error: self.error,
        })
    }
}
