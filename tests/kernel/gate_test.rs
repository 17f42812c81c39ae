//! Gate decisions as seen through `Kernel::propose`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tollgate::config::ToolOverride;
use tollgate::kernel::{DenyReason, Dispatch, Kernel, KernelSettings, Outcome, ProposedAction, ReplayMode};
use tollgate::store::Backends;
use tollgate::tools::ToolRegistry;

fn kernel_with_read_limit(calls: u32) -> Kernel {
    let mut overrides = BTreeMap::new();
    overrides.insert(
        "read_file".to_string(),
        ToolOverride {
            calls_per_turn: Some(calls),
            ..ToolOverride::default()
        },
    );
    let registry = ToolRegistry::builtin().with_overrides(&overrides);
    Kernel::new(Arc::new(registry), Backends::in_memory(), KernelSettings::default())
}

fn kernel() -> Kernel {
    Kernel::new(
        Arc::new(ToolRegistry::builtin()),
        Backends::in_memory(),
        KernelSettings::default(),
    )
}

fn read(path: &str) -> ProposedAction {
    ProposedAction::new("read_file", json!({ "path": path }))
}

fn write(path: &str) -> ProposedAction {
    ProposedAction::new("write_file", json!({ "path": path, "content": "hello" }))
}

#[tokio::test]
async fn fourth_read_exceeds_three_call_budget() {
    let kernel = kernel_with_read_limit(3);

    for i in 0..3 {
        let dispatch = kernel.propose("s1", read("a.txt")).await.expect("propose");
        assert!(matches!(dispatch, Dispatch::Execute { .. }), "call {i} should execute");
    }
    let fourth = kernel.propose("s1", read("a.txt")).await.expect("propose");
    assert_eq!(fourth.deny_reason(), Some(DenyReason::BudgetExceeded));
    assert_eq!(fourth.ledger_idx(), 3);

    let entries: Vec<_> = kernel.ledger("s1", ..).await.expect("ledger").collect();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[3].decision, Outcome::Deny);
    assert_eq!(entries[3].payload["decision"]["reason"], "budget_exceeded");
    assert!(kernel.verify("s1").await.expect("verify"));

    // Replay mode refuses write_file before any other replay check.
    kernel.grant("s1", "write_file").await.expect("grant");
    kernel.set_replay_mode("s1", ReplayMode::Replay).await.expect("mode");
    let denied = kernel.propose("s1", write("out.txt")).await.expect("propose");
    assert_eq!(denied.deny_reason(), Some(DenyReason::ReplayDenied));
    assert!(kernel.verify("s1").await.expect("verify"));
}

#[tokio::test]
async fn unknown_tool_is_denied_and_ledgered() {
    let kernel = kernel();
    let dispatch = kernel
        .propose("s1", ProposedAction::new("format_disk", json!({})))
        .await
        .expect("propose");
    assert_eq!(dispatch.deny_reason(), Some(DenyReason::UnknownTool));
    assert_eq!(dispatch.ledger_idx(), 0);
    assert_eq!(kernel.ledger("s1", ..).await.expect("ledger").len(), 1);
}

#[tokio::test]
async fn grant_is_required_before_anything_else() {
    let kernel = kernel();
    kernel.set_replay_mode("s1", ReplayMode::Replay).await.expect("mode");
    // Not granted wins over replay_denied and malformed arguments.
    let dispatch = kernel
        .propose("s1", ProposedAction::new("write_file", json!({ "path": 7 })))
        .await
        .expect("propose");
    assert_eq!(dispatch.deny_reason(), Some(DenyReason::NotGranted));
}

#[tokio::test]
async fn malformed_arguments_are_denied_with_detail() {
    let kernel = kernel();
    let dispatch = kernel
        .propose("s1", ProposedAction::new("read_file", json!({ "path": 7 })))
        .await
        .expect("propose");
    assert_eq!(dispatch.deny_reason(), Some(DenyReason::MalformedArguments));
    let detail = dispatch.decision().detail.clone().unwrap_or_default();
    assert!(detail.contains("path"), "detail should name the field: {detail}");

    let extra = kernel
        .propose("s1", ProposedAction::new("read_file", json!({ "path": "a", "mode": "rw" })))
        .await
        .expect("propose");
    assert_eq!(extra.deny_reason(), Some(DenyReason::MalformedArguments));
}

#[tokio::test]
async fn capability_needs_grant_and_flag() {
    let kernel = kernel();
    let code = || ProposedAction::new("run_python", json!({ "code": "print(1)" }));

    let ungranted = kernel.propose("s1", code()).await.expect("propose");
    assert_eq!(ungranted.deny_reason(), Some(DenyReason::NotGranted));

    kernel.grant("s1", "run_python").await.expect("grant");
    let flag_off = kernel.propose("s1", code()).await.expect("propose");
    assert_eq!(flag_off.deny_reason(), Some(DenyReason::CapabilityDisabled));

    kernel.set_capability_enabled("s1", true).await.expect("enable");
    let allowed = kernel.propose("s1", code()).await.expect("propose");
    assert!(matches!(allowed, Dispatch::Execute { .. }));

    // Revoking the grant alone is enough to deny again.
    kernel.revoke("s1", "run_python").await.expect("revoke");
    let revoked = kernel.propose("s1", code()).await.expect("propose");
    assert_eq!(revoked.deny_reason(), Some(DenyReason::NotGranted));

    kernel.grant("s1", "run_python").await.expect("grant");
    let regranted = kernel.propose("s1", code()).await.expect("propose");
    assert!(matches!(regranted, Dispatch::Execute { .. }));

    // So is switching the flag off.
    kernel.set_capability_enabled("s1", false).await.expect("disable");
    let disabled = kernel.propose("s1", code()).await.expect("propose");
    assert_eq!(disabled.deny_reason(), Some(DenyReason::CapabilityDisabled));
}

#[tokio::test]
async fn denials_do_not_consume_budget() {
    let kernel = kernel_with_read_limit(1);
    let bad = kernel
        .propose("s1", ProposedAction::new("read_file", json!({})))
        .await
        .expect("propose");
    assert_eq!(bad.deny_reason(), Some(DenyReason::MalformedArguments));

    let good = kernel.propose("s1", read("a.txt")).await.expect("propose");
    assert!(matches!(good, Dispatch::Execute { .. }));
    let budget = kernel.budget("s1").await.expect("budget");
    assert_eq!(budget.calls.get("read_file"), Some(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_proposals_respect_single_call_budget() {
    let kernel = Arc::new(kernel_with_read_limit(1));
    kernel.session("s1").await.expect("session");

    let mut handles = Vec::new();
    for i in 0..16 {
        let kernel = Arc::clone(&kernel);
        handles.push(tokio::spawn(async move {
            kernel
                .propose("s1", read(&format!("f{i}.txt")))
                .await
                .expect("propose")
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        let dispatch = handle.await.expect("join");
        if dispatch.decision().is_allow() {
            allowed += 1;
        } else {
            assert_eq!(dispatch.deny_reason(), Some(DenyReason::BudgetExceeded));
        }
    }
    assert_eq!(allowed, 1);

    let entries: Vec<_> = kernel.ledger("s1", ..).await.expect("ledger").collect();
    assert_eq!(entries.len(), 16);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.idx, i as u64);
    }
    assert!(kernel.verify("s1").await.expect("verify"));
}
