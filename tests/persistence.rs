//! Durability across restarts, divergence detection and rebuild

mod common;

use common::*;
use persona_memory::{AuditAction, Config, Error, MemoryEngine, Ports};
use tokio_test::{assert_err, assert_ok};

fn config_in(dir: &tempfile::TempDir) -> Config {
    Config {
        data_dir: dir.path().to_path_buf(),
        ..offline_config()
    }
}

async fn open(dir: &tempfile::TempDir) -> MemoryEngine {
    MemoryEngine::open(config_in(dir), Ports::offline(DIMS))
        .await
        .expect("open engine")
}

fn tamper(dir: &tempfile::TempDir, sql: &str) {
    let conn = rusqlite::Connection::open(config_in(dir).sqlite_path()).unwrap();
    conn.execute_batch(sql).unwrap();
}

#[tokio::test]
async fn records_and_log_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let (records, log) = {
        let engine = open(&dir).await;
        assert_ok!(engine.add_message("u1", "User likes tea. User owns a dog.").await);
        assert_ok!(engine.add_facts("u1", facts(&["User does not like tea"])).await);
        (
            assert_ok!(engine.list_active("u1").await),
            assert_ok!(engine.audit_log("u1", None)),
        )
    };

    let engine = open(&dir).await;
    assert_eq!(engine.personas().await, vec!["u1"]);
    assert_eq!(assert_ok!(engine.list_active("u1").await), records);
    assert_eq!(assert_ok!(engine.audit_log("u1", None)), log);
    assert_index_matches_store(&engine, "u1").await;
    assert_ok!(engine.verify("u1").await);

    // Short-term memory is volatile
    assert!(assert_ok!(engine.short_term("u1").await).is_empty());

    // Sequence numbers continue where they stopped
    let next = assert_ok!(engine.add_facts("u1", facts(&["User plays chess"])).await);
    assert_eq!(next[0].sequence_no, log.len() as u64 + 1);
}

#[tokio::test]
async fn tampering_is_detected_and_repaired_by_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir).await;
    assert_ok!(engine.add_facts("u1", facts(&["User likes tea", "User owns a dog"])).await);
    assert_ok!(engine.add_facts("u2", facts(&["User plays chess"])).await);

    tamper(&dir, "UPDATE records SET state = 'DELETED' WHERE content = 'User owns a dog'");

    let err = assert_err!(engine.verify("u1").await);
    assert!(matches!(err, Error::ConsistencyViolation { .. }));

    // The poisoned persona refuses reads and writes; others carry on
    assert!(matches!(
        engine.search("u1", "dog", 3).await,
        Err(Error::ConsistencyViolation { .. })
    ));
    assert!(matches!(
        engine.add_facts("u1", facts(&["User drinks coffee"])).await,
        Err(Error::ConsistencyViolation { .. })
    ));
    let other = assert_ok!(engine.add_facts("u2", facts(&["User drinks coffee"])).await);
    assert_eq!(actions(&other), vec![AuditAction::Add]);

    assert_eq!(assert_ok!(engine.rebuild("u1").await), 2);
    assert_ok!(engine.verify("u1").await);
    assert_eq!(
        active_contents(&engine, "u1").await,
        vec!["User likes tea", "User owns a dog"]
    );
    drop(engine);

    // The durable records were rewritten from the log
    let reopened = open(&dir).await;
    assert_ok!(reopened.verify("u1").await);
    assert_eq!(reopened.list_active("u1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn unreadable_persona_loads_poisoned() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = open(&dir).await;
        assert_ok!(engine.add_facts("u1", facts(&["User owns a dog"])).await);
        assert_ok!(engine.add_facts("u2", facts(&["User plays chess"])).await);
    }

    tamper(&dir, "UPDATE records SET embedding = x'000000' WHERE persona_id = 'u1'");

    let engine = open(&dir).await;
    assert!(matches!(
        engine.list_active("u1").await,
        Err(Error::ConsistencyViolation { .. })
    ));
    assert_eq!(active_contents(&engine, "u2").await, vec!["User plays chess"]);

    assert_eq!(assert_ok!(engine.rebuild("u1").await), 1);
    let hits = assert_ok!(engine.search("u1", "dog", 1).await);
    assert_eq!(hits[0].text, "User owns a dog");
}

#[tokio::test]
async fn rebuild_of_unknown_persona_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir).await;
    let err = assert_err!(engine.rebuild("nobody").await);
    assert!(matches!(err, Error::NotFound(_)));
}
