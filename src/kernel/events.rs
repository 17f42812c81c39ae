//! Best-effort per-session event stream.
//!
//! Events are sequence-numbered in causal order and fanned out over a bounded
//! broadcast channel. A slow observer loses the oldest events and is told how
//! many it missed; emitting never blocks and never fails. Losing events has no
//! effect on the ledger or the replay store.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use super::gate::{now_utc, DenyReason, Outcome};
use super::replay::ReplayMode;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The gate decided a proposal.
    DecisionMade {
        /// Tool proposed.
        tool: String,
        /// Gate outcome.
        outcome: Outcome,
        /// Denial reason, if denied.
        reason: Option<DenyReason>,
    },
    /// A live execution was handed to the executor.
    ToolInvoked {
        /// Tool name.
        tool: String,
        /// Call fingerprint.
        fingerprint: String,
        /// Ledger index of the allowing decision.
        ledger_idx: u64,
    },
    /// A live execution reported back.
    ToolResult {
        /// Tool name.
        tool: String,
        /// Whether it succeeded.
        ok: bool,
        /// Short result summary.
        summary: String,
    },
    /// A decision was durably appended.
    LedgerAppended {
        /// Entry index.
        idx: u64,
        /// Entry hash.
        entry_hash: String,
    },
    /// A proposal was denied.
    Denied {
        /// Tool proposed.
        tool: String,
        /// Denial reason.
        reason: DenyReason,
    },
    /// An allowed call was answered from the replay store.
    ReplayHit {
        /// Tool name.
        tool: String,
        /// Call fingerprint.
        fingerprint: String,
    },
    /// A replay-mode call had no record.
    ReplayMiss {
        /// Tool name.
        tool: String,
        /// Call fingerprint.
        fingerprint: String,
    },
    /// A live outcome was recorded.
    ReplayRecorded {
        /// Tool name.
        tool: String,
        /// Call fingerprint.
        fingerprint: String,
        /// Whether the recorded execution succeeded.
        ok: bool,
    },
    /// Grants or the capability flag changed.
    PermissionChanged {
        /// Tool granted or revoked; `None` for the capability flag.
        tool: Option<String>,
        /// New state: granted / capability enabled.
        enabled: bool,
    },
    /// The replay mode changed.
    ReplayModeChanged {
        /// New mode.
        mode: ReplayMode,
    },
    /// An operational failure inside the kernel.
    Error {
        /// Error message.
        message: String,
    },
}

/// One sequence-numbered event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelEvent {
    /// Session the event belongs to.
    pub session_id: String,
    /// Strictly increasing per session, starting at 1.
    pub seq: u64,
    /// RFC 3339 emission time.
    pub ts_utc: String,
    /// Payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Per-session event source.
#[derive(Debug)]
pub struct EventBus {
    session_id: String,
    tx: broadcast::Sender<KernelEvent>,
    /// Held while numbering and sending so seq order equals channel order.
    seq: Mutex<u64>,
}

impl EventBus {
    /// Bus whose observers each buffer up to `capacity` events.
    pub fn new(session_id: &str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            session_id: session_id.to_string(),
            tx,
            seq: Mutex::new(0),
        }
    }

    /// Number and publish an event. Returns its sequence number.
    pub fn emit(&self, kind: EventKind) -> u64 {
        let mut seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        *seq = seq.saturating_add(1);
        let event = KernelEvent {
            session_id: self.session_id.clone(),
            seq: *seq,
            ts_utc: now_utc(),
            kind,
        };
        // No receivers is not an error.
        let _ = self.tx.send(event);
        *seq
    }

    /// New observer that sees events emitted from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            session_id: self.session_id.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One observer's view of a session's events.
#[derive(Debug)]
pub struct EventSubscription {
    session_id: String,
    rx: broadcast::Receiver<KernelEvent>,
}

impl EventSubscription {
    /// Next event, skipping over any that were dropped. `None` once the
    /// session is torn down.
    pub async fn next(&mut self) -> Option<KernelEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(session = %self.session_id, missed, "event observer lagging, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered.
    pub fn try_next(&mut self) -> Option<KernelEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(session = %self.session_id, missed, "event observer lagging, oldest events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Adapt into a [`Stream`] that silently skips dropped events.
    pub fn into_stream(self) -> impl Stream<Item = KernelEvent> {
        BroadcastStream::new(self.rx).filter_map(Result::ok)
    }
}
