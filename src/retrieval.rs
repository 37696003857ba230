//! Ranked, source-tagged context built from long-term and short-term memory

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::embedding::TokenCounter;
use crate::memory::MemoryRecord;
use crate::short_term::ShortTermEntry;
use crate::storage::cosine_similarity;
use crate::text;

/// Which memory a hit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    LongTerm,
    ShortTerm,
}

/// One piece of retrieved context with its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedHit {
    pub text: String,

    /// Record id for long-term hits, `stm-<n>` for short-term hits
    pub source_id: String,

    pub score: f32,
    pub tier: MemoryTier,

    /// Version of the record the text was read from (long-term only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl RetrievedHit {
    pub fn is_long_term(&self) -> bool {
        self.tier == MemoryTier::LongTerm
    }

    fn long_term(record: &MemoryRecord, score: f32) -> Self {
        Self {
            text: record.content.clone(),
            source_id: record.id.to_string(),
            score,
            tier: MemoryTier::LongTerm,
            version: Some(record.version),
        }
    }

    fn short_term(entry: &ShortTermEntry, score: f32) -> Self {
        Self {
            text: entry.text.clone(),
            source_id: entry.id.clone(),
            score,
            tier: MemoryTier::ShortTerm,
            version: None,
        }
    }
}

/// Retrieved context ready for the answer port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedContext {
    /// Hits, best first
    pub hits: Vec<RetrievedHit>,

    /// Tokens in the hits, once budgeted
    pub total_tokens: u32,
}

impl RankedContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Keep the best hits whose texts fit into `max_tokens`; returns tokens used
    pub fn fit_to_budget(&mut self, counter: &TokenCounter, max_tokens: u32) -> u32 {
        let mut used = 0u32;
        let mut keep = 0;
        for hit in &self.hits {
            let tokens = counter.count(&hit.text);
            if used + tokens > max_tokens {
                break;
            }
            used += tokens;
            keep += 1;
        }
        self.hits.truncate(keep);
        self.total_tokens = used;
        used
    }

    /// Source ids in rank order
    pub fn source_ids(&self) -> Vec<String> {
        self.hits.iter().map(|h| h.source_id.clone()).collect()
    }
}

/// Merges long-term search results with relevant short-term entries
#[derive(Debug, Clone)]
pub struct Retriever {
    short_term_max_hits: usize,
    short_term_min_score: f32,
    min_score: f32,
}

impl Retriever {
    pub fn new(config: &Config) -> Self {
        Self {
            short_term_max_hits: config.short_term_max_hits,
            short_term_min_score: config.short_term_min_score,
            min_score: config.min_retrieval_score,
        }
    }

    /// Same retriever with a different long-term score floor
    pub fn with_min_score(&self, min_score: f32) -> Self {
        Self {
            min_score,
            ..self.clone()
        }
    }

    /// Rank long-term matches and short-term entries against a query.
    ///
    /// Short-term entries qualify by cosine score or by substring match, at
    /// most `short_term_max_hits` of them, and are dropped when a long-term
    /// hit that survived the score floor states the same text.
    pub fn rank<'a>(
        &self,
        query: &str,
        query_embedding: &[f32],
        long_term: Vec<(MemoryRecord, f32)>,
        short_term: impl Iterator<Item = &'a ShortTermEntry>,
        k: usize,
    ) -> RankedContext {
        if k == 0 {
            return RankedContext::empty();
        }

        let mut hits: Vec<RetrievedHit> = long_term
            .iter()
            .filter(|(record, score)| record.is_active() && *score >= self.min_score)
            .map(|(record, score)| RetrievedHit::long_term(record, *score))
            .collect();

        let long_term_texts: Vec<String> = hits.iter().map(|h| text::normalize(&h.text)).collect();

        let needle = text::normalize(query);
        let mut recent: Vec<RetrievedHit> = short_term
            .filter_map(|entry| {
                let normalized = text::normalize(&entry.text);
                if long_term_texts.contains(&normalized) {
                    return None;
                }

                let cosine = entry
                    .embedding
                    .as_deref()
                    .map_or(0.0, |e| cosine_similarity(e, query_embedding));
                let lexical = !needle.is_empty()
                    && !normalized.is_empty()
                    && (normalized.contains(&needle) || needle.contains(&normalized));

                if cosine >= self.short_term_min_score {
                    Some(RetrievedHit::short_term(entry, cosine))
                } else if lexical {
                    Some(RetrievedHit::short_term(entry, self.short_term_min_score))
                } else {
                    None
                }
            })
            .collect();

        // Newest first among equals, then keep the best few
        recent.reverse();
        recent.sort_by(|a, b| b.score.total_cmp(&a.score));
        recent.truncate(self.short_term_max_hits);

        hits.extend(recent);
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.is_long_term().cmp(&a.is_long_term()))
        });
        hits.truncate(k);

        RankedContext {
            hits,
            total_tokens: 0,
        }
    }
}
