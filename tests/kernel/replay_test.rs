//! Record, replay, import and export through the kernel.

use std::sync::Arc;

use serde_json::{json, Value};
use tollgate::kernel::replay::fingerprint;
use tollgate::kernel::{
    DenyReason, Dispatch, Kernel, KernelSettings, ProposedAction, ReplayMode, ToolOutcome,
};
use tollgate::store::Backends;
use tollgate::tools::ToolRegistry;

fn kernel() -> Kernel {
    Kernel::new(
        Arc::new(ToolRegistry::builtin()),
        Backends::in_memory(),
        KernelSettings::default(),
    )
}

fn search(query: &str) -> ProposedAction {
    ProposedAction::new("search_web", json!({ "query": query }))
}

async fn record_search(kernel: &Kernel, session: &str, query: &str, outcome: ToolOutcome) {
    let dispatch = kernel.propose(session, search(query)).await.expect("propose");
    let Dispatch::Execute { ticket, .. } = dispatch else {
        panic!("expected live execution, got {dispatch:?}");
    };
    kernel.complete(ticket, outcome).await.expect("complete");
}

#[tokio::test]
async fn recorded_call_is_served_in_replay() {
    let kernel = kernel();
    kernel.set_replay_mode("s1", ReplayMode::Record).await.expect("mode");
    record_search(
        &kernel,
        "s1",
        "rust sqlite",
        ToolOutcome::success("3 results", Some(json!({ "hits": 3 }))),
    )
    .await;
    assert_eq!(kernel.replay_data("s1").await.expect("data").record_count, 1);

    kernel.set_replay_mode("s1", ReplayMode::Replay).await.expect("mode");
    let hit = kernel.propose("s1", search("rust sqlite")).await.expect("propose");
    let Dispatch::Replayed { record, .. } = hit else {
        panic!("expected replay hit, got {hit:?}");
    };
    assert!(record.ok);
    assert_eq!(record.summary, "3 results");
    assert_eq!(record.data, Some(json!({ "hits": 3 })));

    let miss = kernel.propose("s1", search("rust postgres")).await.expect("propose");
    assert_eq!(miss.deny_reason(), Some(DenyReason::ReplayMiss));
    assert!(kernel.verify("s1").await.expect("verify"));
}

#[tokio::test]
async fn argument_key_order_does_not_change_the_fingerprint() {
    let a = json!({ "query": "x", "max_results": 5 });
    let b: Value = serde_json::from_str(r#"{"max_results":5,"query":"x"}"#).expect("json");
    assert_eq!(fingerprint("search_web", &a), fingerprint("search_web", &b));
    assert_ne!(fingerprint("search_web", &a), fingerprint("search_files", &a));
}

#[tokio::test]
async fn failures_are_recorded_too() {
    let kernel = kernel();
    kernel.set_replay_mode("s1", ReplayMode::Record).await.expect("mode");
    record_search(&kernel, "s1", "offline", ToolOutcome::failure("network unreachable")).await;

    let records = kernel.export_replay("s1").await.expect("export");
    assert_eq!(records.len(), 1);
    assert!(!records[0].ok);
    assert_eq!(records[0].summary, "network unreachable");
}

#[tokio::test]
async fn off_mode_records_nothing() {
    let kernel = kernel();
    record_search(&kernel, "s1", "anything", ToolOutcome::success("ok", None)).await;
    assert_eq!(kernel.replay_data("s1").await.expect("data").record_count, 0);
}

#[tokio::test]
async fn replay_denied_tools_stay_denied_even_when_cached() {
    let kernel = kernel();
    let args = json!({ "path": "out.txt", "content": "hi" });
    let report = kernel
        .import_replay("s1", vec![json!({ "tool": "write_file", "args": args, "ok": true })])
        .await
        .expect("import");
    assert_eq!(report.imported, 1);

    kernel.grant("s1", "write_file").await.expect("grant");
    kernel.set_replay_mode("s1", ReplayMode::Replay).await.expect("mode");
    let dispatch = kernel
        .propose("s1", ProposedAction::new("write_file", args))
        .await
        .expect("propose");
    assert_eq!(dispatch.deny_reason(), Some(DenyReason::ReplayDenied));
}

#[tokio::test]
async fn export_then_import_reproduces_the_store() {
    let kernel = kernel();
    kernel.set_replay_mode("s1", ReplayMode::Record).await.expect("mode");
    record_search(&kernel, "s1", "first", ToolOutcome::success("one", None)).await;
    record_search(&kernel, "s1", "second", ToolOutcome::failure("two")).await;

    let jsonl = kernel.export_replay_jsonl("s1").await.expect("export");
    assert_eq!(jsonl.lines().count(), 2);

    let report = kernel.import_replay_jsonl("s2", &jsonl).await.expect("import");
    assert_eq!(report.imported, 2);
    assert!(report.errors.is_empty());
    assert_eq!(
        kernel.replay_data("s1").await.expect("data"),
        kernel.replay_data("s2").await.expect("data")
    );
}

#[tokio::test]
async fn import_skips_malformed_items() {
    let kernel = kernel();
    let good = json!({ "tool": "think", "args": { "thought": "a" }, "ok": true }).to_string();
    let wrong_fp = json!({
        "fingerprint": "0".repeat(64),
        "tool": "think",
        "args": { "thought": "b" },
        "ok": true,
    })
    .to_string();
    let no_tool = json!({ "args": {}, "ok": true }).to_string();
    let text = format!("{good}\nnot json\n\n{wrong_fp}\n{no_tool}\n");

    let report = kernel.import_replay_jsonl("s1", &text).await.expect("import");
    assert_eq!(report.imported, 1);
    let bad: Vec<usize> = report.errors.iter().map(|e| e.index).collect();
    assert_eq!(bad, vec![1, 3, 4]);
    assert_eq!(kernel.replay_data("s1").await.expect("data").record_count, 1);
}

#[tokio::test]
async fn clear_is_idempotent() {
    let kernel = kernel();
    kernel
        .import_replay(
            "s1",
            vec![
                json!({ "tool": "think", "args": { "thought": "a" }, "ok": true }),
                json!({ "tool": "think", "args": { "thought": "b" }, "ok": true }),
            ],
        )
        .await
        .expect("import");

    assert_eq!(kernel.clear_replay("s1").await.expect("clear"), 2);
    assert_eq!(kernel.clear_replay("s1").await.expect("clear"), 0);
    assert!(kernel.export_replay("s1").await.expect("export").is_empty());
}

#[tokio::test]
async fn replay_hits_consume_budget() {
    let kernel = kernel();
    kernel
        .import_replay(
            "s1",
            vec![json!({ "tool": "ask_user", "args": { "question": "continue?" }, "ok": true })],
        )
        .await
        .expect("import");
    kernel.set_replay_mode("s1", ReplayMode::Replay).await.expect("mode");

    let ask = || ProposedAction::new("ask_user", json!({ "question": "continue?" }));
    // ask_user allows 5 calls per turn.
    for _ in 0..5 {
        let dispatch = kernel.propose("s1", ask()).await.expect("propose");
        assert!(matches!(dispatch, Dispatch::Replayed { .. }));
    }
    let sixth = kernel.propose("s1", ask()).await.expect("propose");
    assert_eq!(sixth.deny_reason(), Some(DenyReason::BudgetExceeded));
}
