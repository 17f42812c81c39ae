//! Hash-chained ledger behaviour.

use std::sync::Arc;

use serde_json::json;
use tollgate::canonical::GENESIS_HASH;
use tollgate::kernel::ledger::{verify_chain, ChainError, Ledger, LedgerEntry};
use tollgate::kernel::{Kernel, KernelSettings, Outcome, ProposedAction};
use tollgate::store::{Backends, MemoryStore};
use tollgate::tools::ToolRegistry;

async fn filled_ledger(n: u64) -> Vec<LedgerEntry> {
    let ledger = Ledger::open("s1", Arc::new(MemoryStore::new()))
        .await
        .expect("open");
    for i in 0..n {
        let decision = if i % 2 == 0 { Outcome::Allow } else { Outcome::Deny };
        ledger
            .append(decision, json!({ "n": i }))
            .await
            .expect("append");
    }
    ledger.read(..).map(|e| e.as_ref().clone()).collect()
}

#[tokio::test]
async fn chain_starts_at_genesis_and_links() {
    let entries = filled_ledger(3).await;
    assert_eq!(entries[0].prev_entry_hash, GENESIS_HASH);
    assert_eq!(entries[1].prev_entry_hash, entries[0].entry_hash);
    assert_eq!(entries[2].prev_entry_hash, entries[1].entry_hash);
    assert_eq!(verify_chain(&entries), Ok(3));
}

#[tokio::test]
async fn empty_chain_verifies() {
    let entries: Vec<LedgerEntry> = Vec::new();
    assert_eq!(verify_chain(&entries), Ok(0));
}

#[tokio::test]
async fn payload_edit_is_caught_at_that_entry() {
    let mut entries = filled_ledger(4).await;
    entries[2].payload = json!({ "n": 99 });
    assert_eq!(
        verify_chain(&entries),
        Err(ChainError::EntryHashMismatch { idx: 2 })
    );
}

#[tokio::test]
async fn rehashing_an_edit_breaks_the_next_link() {
    let mut entries = filled_ledger(4).await;
    entries[1].decision = Outcome::Allow;
    entries[1].entry_hash = entries[1].recompute_hash();
    assert_eq!(
        verify_chain(&entries),
        Err(ChainError::PrevHashMismatch { idx: 2 })
    );
}

#[tokio::test]
async fn dropped_entry_is_an_index_gap() {
    let mut entries = filled_ledger(4).await;
    entries.remove(1);
    assert_eq!(
        verify_chain(&entries),
        Err(ChainError::IndexGap {
            position: 1,
            found: 2
        })
    );
}

#[tokio::test]
async fn malformed_hash_is_reported() {
    let mut entries = filled_ledger(2).await;
    entries[0].entry_hash = "XYZ".to_string();
    let err = verify_chain(&entries).expect_err("must fail");
    assert_eq!(err, ChainError::MalformedHash { idx: 0 });
    assert_eq!(err.idx(), 0);
}

#[tokio::test]
async fn read_returns_requested_range() {
    let ledger = Ledger::open("s1", Arc::new(MemoryStore::new()))
        .await
        .expect("open");
    for i in 0..5 {
        ledger
            .append(Outcome::Allow, json!({ "n": i }))
            .await
            .expect("append");
    }
    let idxs: Vec<u64> = ledger.read(1..3).map(|e| e.idx).collect();
    assert_eq!(idxs, vec![1, 2]);
    let tail: Vec<u64> = ledger.read(3..).map(|e| e.idx).collect();
    assert_eq!(tail, vec![3, 4]);
    assert_eq!(ledger.read(10..).len(), 0);
    assert_eq!(ledger.len(), 5);
}

#[tokio::test]
async fn kernel_ledger_payload_records_action_and_decision() {
    let kernel = Kernel::new(
        Arc::new(ToolRegistry::builtin()),
        Backends::in_memory(),
        KernelSettings::default(),
    );
    let action = ProposedAction::new("think", json!({ "thought": "check the plan" }));
    let fingerprint = action.fingerprint();
    kernel.propose("s1", action).await.expect("propose");

    let entry = kernel
        .ledger("s1", ..)
        .await
        .expect("ledger")
        .next()
        .expect("one entry");
    assert_eq!(entry.decision, Outcome::Allow);
    assert_eq!(entry.payload["session_id"], "s1");
    assert_eq!(entry.payload["action"]["tool"], "think");
    assert_eq!(entry.payload["fingerprint"], fingerprint.as_str());
    assert_eq!(entry.payload["decision"]["outcome"], "allow");

    let report = kernel.verify_report("s1").await.expect("verify");
    assert!(report.ok);
    assert_eq!(report.entries, 1);
    assert!(report.error.is_none());
}

#[tokio::test]
async fn edit_taints_every_later_prefix() {
    let mut entries = filled_ledger(5).await;
    entries[2].payload = json!({ "n": "edited" });
    for end in 0..entries.len() {
        let prefix = &entries[..=end];
        assert_eq!(verify_chain(prefix).is_ok(), end < 2, "prefix ending at {end}");
    }
}
