//! Narrow interfaces to the external collaborators of the engine.
//!
//! Embedding, fact extraction, semantic judgment and answer generation are
//! request/response capabilities. The engine wraps every call in a timeout
//! and maps failures to [`Error::PortUnavailable`]; retries belong to callers.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Port, Result};
use crate::retrieval::RetrievedHit;

/// Text to fixed-length vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` on behalf of `persona`
    async fn embed(&self, text: &str, persona: &str) -> Result<Vec<f32>>;

    /// Length of every vector this embedder returns
    fn dimensions(&self) -> usize;
}

/// Message plus recent context to an ordered list of candidate facts
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(&self, message: &str, recent_context: &[String]) -> Result<Vec<String>>;
}

/// Verdict of a semantic comparison between a candidate and an existing fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Judgment {
    Equivalent,
    Refinement,
    Contradiction,
    Unrelated,
}

/// Optional semantic classifier consulted instead of the similarity thresholds
#[async_trait]
pub trait SemanticJudge: Send + Sync {
    async fn classify(&self, candidate: &str, existing: &str) -> Result<Judgment>;
}

/// Query plus ranked context to a natural-language answer
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, query: &str, context: &[RetrievedHit]) -> Result<String>;
}

/// Run a port call under `timeout`, reporting every failure as `PortUnavailable`
pub(crate) async fn call<T>(
    port: Port,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e @ Error::PortUnavailable { .. })) => Err(e),
        Ok(Err(e)) => Err(Error::port(port, e.to_string())),
        Err(_) => Err(Error::port(
            port,
            format!("timed out after {} ms", timeout.as_millis()),
        )),
    }
}

/// Splits a message into declarative sentences; questions are not facts
#[derive(Debug, Clone, Copy, Default)]
pub struct SentenceExtractor;

impl SentenceExtractor {
    /// Sentences of `message` with their terminators stripped, questions dropped
    pub fn sentences(message: &str) -> Vec<String> {
        let mut facts = Vec::new();
        let mut current = String::new();

        let mut flush = |current: &mut String, question: bool| {
            let sentence = current.trim();
            if !question && sentence.chars().any(char::is_alphanumeric) {
                facts.push(sentence.to_string());
            }
            current.clear();
        };

        for c in message.chars() {
            match c {
                '.' | '!' | '\n' | ';' => flush(&mut current, false),
                '?' => flush(&mut current, true),
                _ => current.push(c),
            }
        }
        flush(&mut current, false);

        facts
    }
}

#[async_trait]
impl FactExtractor for SentenceExtractor {
    async fn extract(&self, message: &str, _recent_context: &[String]) -> Result<Vec<String>> {
        Ok(Self::sentences(message))
    }
}

/// Answers with the best-ranked context lines and their citation numbers
#[derive(Debug, Clone, Copy)]
pub struct ExtractiveAnswerer {
    max_lines: usize,
}

impl ExtractiveAnswerer {
    pub fn new(max_lines: usize) -> Self {
        Self { max_lines }
    }
}

impl Default for ExtractiveAnswerer {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl AnswerGenerator for ExtractiveAnswerer {
    async fn generate(&self, _query: &str, context: &[RetrievedHit]) -> Result<String> {
        if context.is_empty() {
            return Ok("Nothing relevant is stored in memory.".to_string());
        }

        let lines: Vec<String> = context
            .iter()
            .take(self.max_lines.max(1))
            .enumerate()
            .map(|(i, hit)| format!("{} [{}]", hit.text, i + 1))
            .collect();

        Ok(lines.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::MemoryTier;

    #[test]
    fn sentences_split_and_skip_questions() {
        assert_eq!(
            SentenceExtractor::sentences("User likes tea. User does not like tea."),
            vec!["User likes tea", "User does not like tea"]
        );
        assert_eq!(
            SentenceExtractor::sentences("Favourite food is sushi"),
            vec!["Favourite food is sushi"]
        );
        assert!(SentenceExtractor::sentences("What food do I like?").is_empty());
        assert_eq!(
            SentenceExtractor::sentences("Do you know me? I live in Paris!\n\n..."),
            vec!["I live in Paris"]
        );
    }

    #[tokio::test]
    async fn extractive_answer_cites_hits() {
        let hits = vec![
            RetrievedHit {
                text: "Favourite food is sushi".into(),
                source_id: "a".into(),
                score: 0.8,
                tier: MemoryTier::LongTerm,
                version: Some(1),
            },
            RetrievedHit {
                text: "I had ramen yesterday".into(),
                source_id: "stm-1".into(),
                score: 0.5,
                tier: MemoryTier::ShortTerm,
                version: None,
            },
        ];

        let answer = ExtractiveAnswerer::default()
            .generate("food?", &hits)
            .await
            .unwrap();
        assert_eq!(answer, "Favourite food is sushi [1] I had ramen yesterday [2]");

        let nothing = ExtractiveAnswerer::new(1).generate("food?", &[]).await.unwrap();
        assert!(!nothing.is_empty());
    }

    #[tokio::test]
    async fn call_maps_timeouts_and_errors() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(1)
        };
        let err = call(Port::Embedding, Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortUnavailable { port: Port::Embedding, .. }));

        let failing = async { Err::<u32, _>(Error::storage("disk")) };
        let err = call(Port::Answer, Duration::from_secs(1), failing).await.unwrap_err();
        assert!(matches!(err, Error::PortUnavailable { port: Port::Answer, .. }));
    }
}
