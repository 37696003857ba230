//! Volatile ring buffer of recent raw messages, one per persona

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix marking short-term source ids
pub const SHORT_TERM_PREFIX: &str = "stm-";

/// A recent raw message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortTermEntry {
    /// `stm-<n>`, unique within the persona for the life of the process
    pub id: String,
    pub persona_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,

    /// Embedding of `text`, when the embedding port was reachable
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// Fixed-capacity buffer; the oldest entry is evicted on overflow
#[derive(Debug, Clone)]
pub struct ShortTermBuffer {
    persona_id: String,
    capacity: usize,
    entries: VecDeque<ShortTermEntry>,
    next_id: u64,
}

impl ShortTermBuffer {
    pub fn new(persona_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            persona_id: persona_id.into(),
            capacity,
            entries: VecDeque::with_capacity(capacity),
            next_id: 1,
        }
    }

    /// Append an entry, returning the evicted one if the buffer was full
    pub fn append(&mut self, entry: ShortTermEntry) -> Result<Option<ShortTermEntry>> {
        if entry.persona_id != self.persona_id {
            return Err(Error::invalid_input(format!(
                "entry for '{}' appended to buffer of '{}'",
                entry.persona_id, self.persona_id
            )));
        }
        if self.capacity == 0 {
            return Ok(Some(entry));
        }

        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        Ok(evicted)
    }

    /// Record a new message under a fresh `stm-<n>` id
    pub fn record(&mut self, text: impl Into<String>, embedding: Option<Vec<f32>>) -> ShortTermEntry {
        let entry = ShortTermEntry {
            id: format!("{}{}", SHORT_TERM_PREFIX, self.next_id),
            persona_id: self.persona_id.clone(),
            text: text.into(),
            timestamp: Utc::now(),
            embedding,
        };
        self.next_id += 1;

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        if self.capacity > 0 {
            self.entries.push_back(entry.clone());
        }
        entry
    }

    /// Entries oldest to newest; restartable
    pub fn recent(&self) -> impl Iterator<Item = &ShortTermEntry> + Clone + '_ {
        self.entries.iter()
    }

    /// Texts oldest to newest, excluding the newest `skip_last`
    pub fn texts(&self, skip_last: usize) -> Vec<String> {
        let keep = self.entries.len().saturating_sub(skip_last);
        self.entries.iter().take(keep).map(|e| e.text.clone()).collect()
    }

    /// Drop every entry; ids keep counting up
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
