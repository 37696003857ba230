//! Concurrent writers on one and on several personas

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use persona_memory::{AuditAction, AuditEntry, Ports};
use tokio_test::assert_ok;

const WORDS: &[&str] = &[
    "apples", "bicycles", "canoes", "dragons", "emeralds", "falcons", "guitars", "harbours",
    "igloos", "jasmine", "kites", "lanterns", "marbles", "nutmeg", "orchids", "pianos",
];

fn batch(tag: &str) -> Vec<String> {
    WORDS
        .iter()
        .map(|w| format!("{} collects {}", tag, w))
        .collect()
}

fn assert_consecutive(entries: &[AuditEntry]) {
    for pair in entries.windows(2) {
        assert_eq!(pair[1].sequence_no, pair[0].sequence_no + 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_personas_do_not_interfere() {
    let engine = Arc::new(engine().await);

    let tasks: Vec<_> = ["alice", "bob", "carol"]
        .into_iter()
        .map(|persona| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut all = Vec::new();
                for fact in batch(persona) {
                    all.extend(engine.add_facts(persona, vec![fact]).await.unwrap());
                }
                (persona, all)
            })
        })
        .collect();

    for task in tasks {
        let (persona, entries) = task.await.unwrap();
        assert_eq!(entries.len(), WORDS.len());
        assert_contiguous(&entries);
        assert_index_matches_store(&engine, persona).await;
        assert_ok!(engine.verify(persona).await);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_persona_batches_are_serialized() {
    let engine = Arc::new(engine().await);

    let tasks: Vec<_> = ["north", "south", "east", "west"]
        .into_iter()
        .map(|tag| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.add_facts("shared", batch(tag)).await.unwrap() })
        })
        .collect();

    let mut total = 0;
    for task in tasks {
        let entries = task.await.unwrap();
        assert_eq!(entries.len(), WORDS.len());
        // A batch holds the persona's write lock from its first to its last candidate
        assert_consecutive(&entries);
        total += entries.len();
    }

    let log = assert_ok!(engine.audit_log("shared", None));
    assert_eq!(log.len(), total);
    assert_contiguous(&log);
    assert_index_matches_store(&engine, "shared").await;
    assert_ok!(engine.verify("shared").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_see_store_and_index_in_step() {
    let engine = Arc::new(engine().await);
    assert_ok!(engine.add_facts("u1", facts(&["User owns a dog"])).await);

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for fact in batch("u1") {
                engine.add_facts("u1", vec![fact]).await.unwrap();
            }
        })
    };

    for _ in 0..50 {
        for hit in assert_ok!(engine.search("u1", "collects", 5).await) {
            if hit.is_long_term() {
                let id = hit.source_id.parse().unwrap();
                assert!(assert_ok!(engine.get_record("u1", id).await).is_active());
            }
        }
        tokio::task::yield_now().await;
    }

    writer.await.unwrap();
    assert_index_matches_store(&engine, "u1").await;
}

#[tokio::test]
async fn dropped_batch_leaves_no_trace() {
    let engine = engine_with(Ports::offline(DIMS).with_judge(Arc::new(StalledJudge))).await;
    let seeded = assert_ok!(engine.add_facts("u1", facts(&["User likes tea"])).await);
    let before = assert_ok!(engine.list_active("u1").await);

    // Same terms as the seeded fact, so the judge is consulted and never returns
    let cancelled = tokio::time::timeout(
        Duration::from_millis(100),
        engine.add_facts("u1", facts(&["The user likes tea"])),
    )
    .await;
    assert!(cancelled.is_err());

    assert_eq!(assert_ok!(engine.list_active("u1").await), before);
    assert_index_matches_store(&engine, "u1").await;
    assert_eq!(assert_ok!(engine.audit_log("u1", None)).len(), seeded.len());
    assert_ok!(engine.verify("u1").await);

    // The writer lock went away with the dropped future
    let next = assert_ok!(engine.add_facts("u1", facts(&["User plays chess"])).await);
    assert_eq!(actions(&next), vec![AuditAction::Add]);
    assert_eq!(next[0].sequence_no, 2);
}
