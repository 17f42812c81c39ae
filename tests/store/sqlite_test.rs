//! SQLite backend: persistence across restarts, tamper detection, schema.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tollgate::kernel::ledger::{ChainError, LedgerEntry};
use tollgate::kernel::replay::ReplayRecord;
use tollgate::kernel::{
    Dispatch, Kernel, KernelSettings, Outcome, ProposedAction, ReplayMode, ToolOutcome,
};
use tollgate::store::{
    Backends, LedgerBackend, ReplayBackend, SessionCatalog, SqliteStore, StoreError,
};
use tollgate::tools::ToolRegistry;

async fn kernel_at(path: &Path) -> (Kernel, SqliteStore) {
    let store = SqliteStore::open(path).await.expect("open store");
    let backends = Backends::from_store(Arc::new(store.clone()), path.display().to_string());
    let kernel = Kernel::new(
        Arc::new(ToolRegistry::builtin()),
        backends,
        KernelSettings::default(),
    );
    (kernel, store)
}

fn think(thought: &str) -> ProposedAction {
    ProposedAction::new("think", json!({ "thought": thought }))
}

#[tokio::test]
async fn open_creates_missing_parent_directories() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("nested/dir/tollgate.db");
    SqliteStore::open(&path).await.expect("open");
    assert!(path.exists());
}

#[tokio::test]
async fn state_survives_a_restart() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("tollgate.db");

    {
        let (kernel, _store) = kernel_at(&path).await;
        kernel.set_replay_mode("s1", ReplayMode::Record).await.expect("mode");
        for thought in ["a", "b"] {
            let dispatch = kernel.propose("s1", think(thought)).await.expect("propose");
            let Dispatch::Execute { ticket, .. } = dispatch else {
                panic!("expected live execution, got {dispatch:?}");
            };
            kernel
                .complete(ticket, ToolOutcome::success(format!("noted {thought}"), None))
                .await
                .expect("complete");
        }
        kernel.set_replay_mode("s1", ReplayMode::Replay).await.expect("mode");
    }

    let (kernel, _store) = kernel_at(&path).await;
    assert_eq!(kernel.replay_mode("s1").await.expect("mode"), ReplayMode::Replay);
    assert_eq!(kernel.ledger("s1", ..).await.expect("ledger").len(), 2);
    assert!(kernel.verify("s1").await.expect("verify"));

    let records = kernel.export_replay("s1").await.expect("export");
    let summaries: Vec<&str> = records.iter().map(|r| r.summary.as_str()).collect();
    assert_eq!(summaries, vec!["noted a", "noted b"]);

    // The restored records answer replay-mode proposals.
    let hit = kernel.propose("s1", think("b")).await.expect("propose");
    assert!(matches!(hit, Dispatch::Replayed { ledger_idx: 2, .. }));
    assert!(kernel.verify("s1").await.expect("verify"));
}

#[tokio::test]
async fn out_of_band_edit_fails_verification_at_that_entry() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("tollgate.db");
    let (kernel, store) = kernel_at(&path).await;
    for thought in ["a", "b", "c", "d"] {
        kernel.propose("s1", think(thought)).await.expect("propose");
    }
    assert!(kernel.verify("s1").await.expect("verify"));

    sqlx::query("UPDATE ledger_entries SET payload = ?1 WHERE session_id = ?2 AND idx = ?3")
        .bind(json!({ "forged": true }).to_string())
        .bind("s1")
        .bind(2_i64)
        .execute(store.pool())
        .await
        .expect("tamper");

    let report = kernel.verify_report("s1").await.expect("verify");
    assert!(!report.ok);
    assert_eq!(report.error, Some(ChainError::EntryHashMismatch { idx: 2 }));
    assert_eq!(report.entries, 2);
    assert!(!kernel.verify("s1").await.expect("verify"));
}

#[tokio::test]
async fn deleted_row_is_an_index_gap() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("tollgate.db");
    let (kernel, store) = kernel_at(&path).await;
    for thought in ["a", "b", "c"] {
        kernel.propose("s1", think(thought)).await.expect("propose");
    }

    sqlx::query("DELETE FROM ledger_entries WHERE session_id = 's1' AND idx = 0")
        .execute(store.pool())
        .await
        .expect("delete");

    let report = kernel.verify_report("s1").await.expect("verify");
    assert_eq!(
        report.error,
        Some(ChainError::IndexGap {
            position: 0,
            found: 1
        })
    );
}

#[tokio::test]
async fn duplicate_ledger_index_is_rejected() {
    let store = SqliteStore::open_in_memory().await.expect("open");
    let entry = LedgerEntry {
        idx: 0,
        ts_utc: "2026-01-01T00:00:00.000000Z".to_string(),
        decision: Outcome::Allow,
        payload: json!({}),
        prev_entry_hash: "0".repeat(64),
        entry_hash: "1".repeat(64),
    };
    store.append_entry("s1", &entry).await.expect("first append");
    let err = store.append_entry("s1", &entry).await;
    assert!(matches!(err, Err(StoreError::DuplicateIndex { idx: 0, .. })));

    // Same index in another session is fine.
    store.append_entry("s2", &entry).await.expect("other session");
    assert_eq!(store.load_entries("s1").await.expect("load").len(), 1);
}

#[tokio::test]
async fn schema_applies_twice() {
    let store = SqliteStore::open_in_memory().await.expect("open");
    SqliteStore::from_pool(store.pool().clone())
        .await
        .expect("second apply");
}

#[tokio::test]
async fn re_recording_moves_a_record_to_the_end() {
    let store = SqliteStore::open_in_memory().await.expect("open");
    let a = ReplayRecord::new("think", json!({ "thought": "a" }), true, "a1", None);
    let b = ReplayRecord::new("think", json!({ "thought": "b" }), true, "b1", None);
    let a2 = ReplayRecord::new("think", json!({ "thought": "a" }), false, "a2", Some(json!([1, 2])));

    store.put_record("s1", &a).await.expect("put");
    store.put_record("s1", &b).await.expect("put");
    store.put_record("s1", &a2).await.expect("put");

    let loaded = store.load_records("s1").await.expect("load");
    assert_eq!(loaded, vec![b, a2]);

    assert_eq!(store.clear_records("s1").await.expect("clear"), 2);
    assert_eq!(store.clear_records("s1").await.expect("clear"), 0);
}

#[tokio::test]
async fn session_catalogue_round_trip() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("tollgate.db");
    let (kernel, store) = kernel_at(&path).await;
    kernel.session("older").await.expect("session");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    kernel.session("newer").await.expect("session");

    let listed = store.list_sessions(10).await.expect("list");
    let ids: Vec<&str> = listed.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["newer", "older"]);
    assert_eq!(listed[0].store_location, path.display().to_string());

    assert!(store.delete_session("older").await.expect("delete"));
    assert!(!store.delete_session("older").await.expect("delete"));
    assert!(store.load_session("older").await.expect("load").is_none());
}
