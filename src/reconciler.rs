//! Decides, for each candidate fact, between ADD, UPDATE, DELETE+ADD and NONE

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::config::Config;
use crate::error::{Error, Port, Result};
use crate::memory::MemoryRecord;
use crate::ports::{self, Judgment, SemanticJudge};
use crate::storage::{Decision, Namespace, Step};
use crate::text;

/// Classify a candidate against its best match from similarity alone.
///
/// A difference in negation polarity is a contradiction even above the
/// duplicate threshold, so "X" followed by "not X" never collapses into NONE.
pub fn classify_by_similarity(
    candidate: &str,
    existing: &str,
    score: f32,
    consider_threshold: f32,
    duplicate_threshold: f32,
) -> Judgment {
    if score < consider_threshold {
        Judgment::Unrelated
    } else if text::has_negation(candidate) != text::has_negation(existing) {
        Judgment::Contradiction
    } else if score >= duplicate_threshold {
        Judgment::Equivalent
    } else {
        Judgment::Refinement
    }
}

/// A candidate that could not be applied, with the record it matched
struct CandidateFailure {
    error: Error,
    record_id: Option<Uuid>,
}

impl From<Error> for CandidateFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            record_id: None,
        }
    }
}

/// Whether an error stays scoped to one candidate instead of aborting the batch
fn is_candidate_level(error: &Error) -> bool {
    matches!(
        error,
        Error::DimensionMismatch { .. }
            | Error::NonFiniteEmbedding { .. }
            | Error::VersionConflict { .. }
            | Error::PortUnavailable { .. }
    )
}

/// Reconciliation decision core
pub struct Reconciler {
    consider_threshold: f32,
    duplicate_threshold: f32,
    top_k: usize,
    judge: Option<Arc<dyn SemanticJudge>>,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(config: &Config, judge: Option<Arc<dyn SemanticJudge>>) -> Self {
        Self {
            consider_threshold: config.consider_threshold,
            duplicate_threshold: config.duplicate_threshold,
            top_k: config.top_k,
            judge,
            timeout: config.port_timeout(),
        }
    }

    /// Reconcile one candidate against the current state of `namespace`.
    ///
    /// The caller must hold the persona's write lock for the whole batch.
    /// Candidate-level failures come back as a NONE entry carrying the error;
    /// storage and consistency failures are returned as errors.
    pub async fn reconcile(
        &self,
        namespace: &Namespace,
        candidate: &str,
        embedding: Result<Vec<f32>>,
    ) -> Result<Vec<AuditEntry>> {
        let embedding = match embedding {
            Ok(embedding) => embedding,
            Err(error) => {
                return self.record_failure(namespace, candidate, CandidateFailure::from(error));
            }
        };

        let mut retried = false;
        loop {
            let failure = match self.decide(namespace, candidate, &embedding).await {
                Ok((decision, matched)) => match namespace.apply(decision) {
                    Ok(entries) => return Ok(entries),
                    Err(error) if error.is_version_conflict() && !retried => {
                        debug!(
                            persona = %namespace.persona(),
                            candidate = %candidate,
                            "Version conflict; re-reading and reclassifying"
                        );
                        retried = true;
                        continue;
                    }
                    Err(error) => CandidateFailure {
                        error,
                        record_id: matched,
                    },
                },
                Err(failure) => failure,
            };

            return self.record_failure(namespace, candidate, failure);
        }
    }

    /// Build the decision for a candidate, and the id of its best match.
    ///
    /// The judge is asked about the live best match, so it runs under the
    /// persona's write lock; a retry after a version conflict asks it again.
    async fn decide(
        &self,
        namespace: &Namespace,
        candidate: &str,
        embedding: &[f32],
    ) -> std::result::Result<(Decision, Option<Uuid>), CandidateFailure> {
        let persona = namespace.persona();
        let fresh = || Step::Add(MemoryRecord::new(persona, candidate, embedding.to_vec()));

        let neighbours = namespace.search(embedding, self.top_k)?;

        // A verbatim restatement is NONE even when its embedding carries no signal
        if let Some(same) = namespace.find_verbatim(candidate)? {
            debug!(persona = %persona, record_id = %same.id, "Candidate restates a record verbatim");
            let step = Step::Observe {
                record_id: Some(same.id),
                error: None,
            };
            return Ok((Decision::single(candidate, step), Some(same.id)));
        }

        let best = neighbours
            .into_iter()
            .next()
            .filter(|(_, score)| *score >= self.consider_threshold);

        let Some((best, score)) = best else {
            debug!(persona = %persona, candidate = %candidate, "No match above threshold");
            return Ok((Decision::single(candidate, fresh()), None));
        };

        let judgment = match &self.judge {
            Some(judge) => ports::call(
                Port::Judgment,
                self.timeout,
                judge.classify(candidate, &best.content),
            )
            .await
            .map_err(|error| CandidateFailure {
                error,
                record_id: Some(best.id),
            })?,
            None => classify_by_similarity(
                candidate,
                &best.content,
                score,
                self.consider_threshold,
                self.duplicate_threshold,
            ),
        };

        debug!(
            persona = %persona,
            record_id = %best.id,
            score,
            judgment = ?judgment,
            "Classified candidate"
        );

        let steps = match judgment {
            Judgment::Equivalent => vec![Step::Observe {
                record_id: Some(best.id),
                error: None,
            }],
            Judgment::Refinement => vec![Step::Update {
                id: best.id,
                expected_version: best.version,
                content: candidate.to_string(),
                embedding: embedding.to_vec(),
            }],
            Judgment::Contradiction => vec![
                Step::Delete {
                    id: best.id,
                    expected_version: best.version,
                },
                fresh(),
            ],
            Judgment::Unrelated => vec![fresh()],
        };

        Ok((Decision::new(candidate, steps), Some(best.id)))
    }

    /// Write a NONE entry for a failed candidate, or escalate non-candidate errors
    fn record_failure(
        &self,
        namespace: &Namespace,
        candidate: &str,
        failure: CandidateFailure,
    ) -> Result<Vec<AuditEntry>> {
        if !is_candidate_level(&failure.error) {
            return Err(failure.error);
        }

        self.record_error(namespace, candidate, &failure.error, failure.record_id)
    }

    /// Append a NONE entry carrying `error` for a candidate that was not reconciled
    pub(crate) fn record_error(
        &self,
        namespace: &Namespace,
        candidate: &str,
        error: &Error,
        record_id: Option<Uuid>,
    ) -> Result<Vec<AuditEntry>> {
        warn!(
            persona = %namespace.persona(),
            candidate = %candidate,
            error = %error,
            "Candidate skipped"
        );

        namespace.apply(Decision::single(
            candidate,
            Step::Observe {
                record_id,
                error: Some(error.to_string()),
            },
        ))
    }
}
