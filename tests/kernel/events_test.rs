//! Event stream ordering as observed through the kernel.

use std::sync::Arc;

use serde_json::json;
use tokio_stream::StreamExt;
use tollgate::kernel::{
    DenyReason, Dispatch, EventKind, Kernel, KernelSettings, Outcome, ProposedAction, ReplayMode,
    ToolOutcome,
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

fn type_of(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::DecisionMade { .. } => "decision_made",
        EventKind::ToolInvoked { .. } => "tool_invoked",
        EventKind::ToolResult { .. } => "tool_result",
        EventKind::LedgerAppended { .. } => "ledger_appended",
        EventKind::Denied { .. } => "denied",
        EventKind::ReplayHit { .. } => "replay_hit",
        EventKind::ReplayMiss { .. } => "replay_miss",
        EventKind::ReplayRecorded { .. } => "replay_recorded",
        EventKind::PermissionChanged { .. } => "permission_changed",
        EventKind::ReplayModeChanged { .. } => "replay_mode_changed",
        EventKind::Error { .. } => "error",
    }
}

#[tokio::test]
async fn live_call_in_record_mode_emits_in_causal_order() {
    let kernel = kernel();
    kernel.session("s1").await.expect("session");
    let mut events = kernel.subscribe("s1").await.expect("subscribe");

    kernel.set_replay_mode("s1", ReplayMode::Record).await.expect("mode");
    let dispatch = kernel
        .propose("s1", ProposedAction::new("list_dir", json!({ "path": "." })))
        .await
        .expect("propose");
    let Dispatch::Execute { ticket, .. } = dispatch else {
        panic!("expected live execution, got {dispatch:?}");
    };
    kernel
        .complete(ticket, ToolOutcome::success("4 entries", None))
        .await
        .expect("complete");

    let seen: Vec<_> = std::iter::from_fn(|| events.try_next()).collect();
    let types: Vec<&str> = seen.iter().map(|e| type_of(&e.kind)).collect();
    assert_eq!(
        types,
        vec![
            "replay_mode_changed",
            "decision_made",
            "ledger_appended",
            "tool_invoked",
            "tool_result",
            "replay_recorded",
        ]
    );
    let seqs: Vec<u64> = seen.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    assert!(seen.iter().all(|e| e.session_id == "s1"));
}

#[tokio::test]
async fn denial_emits_decision_then_denied() {
    let kernel = kernel();
    let mut events = kernel.subscribe("s1").await.expect("subscribe");

    kernel
        .propose("s1", ProposedAction::new("nope", json!({})))
        .await
        .expect("propose");

    let seen: Vec<EventKind> = std::iter::from_fn(|| events.try_next())
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        seen[0],
        EventKind::DecisionMade {
            tool: "nope".to_string(),
            outcome: Outcome::Deny,
            reason: Some(DenyReason::UnknownTool),
        }
    );
    assert!(matches!(seen[1], EventKind::LedgerAppended { idx: 0, .. }));
    assert_eq!(
        seen[2],
        EventKind::Denied {
            tool: "nope".to_string(),
            reason: DenyReason::UnknownTool,
        }
    );
    assert_eq!(seen.len(), 3);
}

#[tokio::test]
async fn stream_adapter_yields_events() {
    let kernel = kernel();
    let stream = kernel.subscribe("s1").await.expect("subscribe").into_stream();
    tokio::pin!(stream);

    kernel.new_turn("s1").await.expect("turn");
    kernel.set_replay_mode("s1", ReplayMode::Replay).await.expect("mode");

    let event = stream.next().await.expect("event");
    assert_eq!(event.seq, 1);
    assert_eq!(
        event.kind,
        EventKind::ReplayModeChanged {
            mode: ReplayMode::Replay
        }
    );
}

#[tokio::test]
async fn teardown_closes_subscriptions() {
    let kernel = kernel();
    let mut events = kernel.subscribe("s1").await.expect("subscribe");
    assert!(kernel.teardown("s1").await.expect("teardown"));
    assert!(events.next().await.is_none());
}
