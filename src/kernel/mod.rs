//! Authorization kernel: gate, ledger, replay store, budget and permissions
//! bound together per session.
//!
//! The [`Kernel`] owns a keyed table of sessions created on first reference.
//! [`Kernel::propose`] is the only path from an untrusted proposal to a tool
//! execution: it evaluates the gate and appends the decision to the ledger as
//! one atomic step per session, then either hands out an [`ExecutionTicket`],
//! answers from the replay store, or reports the denial.

pub mod budget;
pub mod events;
pub mod gate;
pub mod ledger;
pub mod permissions;
pub mod replay;
pub mod session;

use std::collections::HashMap;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{OnceCell, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::TollgateConfig;
use crate::store::{Backends, SessionRecord, StoreError};
use crate::tools::ToolRegistry;

pub use self::budget::BudgetSnapshot;
pub use self::events::{EventKind, EventSubscription, KernelEvent};
pub use self::gate::{Decision, DenyReason, Outcome, ProposedAction};
pub use self::ledger::{ChainError, LedgerEntry, LedgerView, VerifyReport};
pub use self::permissions::PermissionSet;
pub use self::replay::{ImportReport, InvalidReplayMode, ReplayData, ReplayMode, ReplayRecord};
pub use self::session::{Session, WorldDescriptor};

use self::events::EventBus;
use self::gate::GateContext;
use self::ledger::Ledger;
use self::replay::ReplayStore;
use self::session::DecisionState;

/// Session table slot. Filled once, outside the table lock.
type SessionSlot = Arc<OnceCell<Arc<Session>>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Operational kernel failures. Denials are [`Decision`]s, never errors.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Durable storage failed; no partial entry or record was kept.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// No live session with this id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session ids must be non-empty.
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),

    /// The turn moved on since the caller looked.
    #[error("stale turn: caller observed turn {observed}, current turn is {current}")]
    StaleTurn {
        /// Turn the caller expected.
        observed: u64,
        /// Actual current turn.
        current: u64,
    },

    /// Unrecognized replay mode label.
    #[error(transparent)]
    InvalidReplayMode(#[from] InvalidReplayMode),
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Per-kernel settings applied to new sessions.
#[derive(Debug, Clone)]
pub struct KernelSettings {
    /// Event buffer per observer.
    pub event_buffer: usize,
    /// Replay mode of sessions not found in the catalogue.
    pub default_replay_mode: ReplayMode,
    /// Working directory recorded on new sessions.
    pub working_dir: String,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            default_replay_mode: ReplayMode::Off,
            working_dir: current_dir(),
        }
    }
}

impl KernelSettings {
    /// Settings from the `[kernel]` config section.
    pub fn from_config(config: &TollgateConfig) -> Self {
        Self {
            event_buffer: config.kernel.event_buffer,
            default_replay_mode: config.kernel.default_replay_mode,
            working_dir: config
                .kernel
                .working_dir
                .as_ref()
                .map_or_else(current_dir, |p| p.display().to_string()),
        }
    }
}

fn current_dir() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Permission to run one live execution. Hand it back through
/// [`Kernel::complete`] exactly once.
#[derive(Debug, Serialize)]
pub struct ExecutionTicket {
    /// Session id.
    pub session_id: String,
    /// Generation of the aggregate that issued the ticket.
    pub session_generation: u64,
    /// Tool to run.
    pub tool: String,
    /// Arguments as allowed.
    pub arguments: Value,
    /// Call fingerprint.
    pub fingerprint: String,
    /// Ledger index of the allowing decision.
    pub ledger_idx: u64,
    /// Turn the budget was charged in.
    pub turn: u64,
    /// Bytes reserved for the call.
    pub reserved_bytes: u64,
    /// Replay mode at decision time; decides whether the outcome is recorded.
    pub mode: ReplayMode,
}

/// What the caller should do with a proposal.
#[derive(Debug, Serialize)]
#[serde(tag = "dispatch", rename_all = "snake_case")]
pub enum Dispatch {
    /// Run the tool live, then call [`Kernel::complete`].
    Execute {
        /// The allow.
        decision: Decision,
        /// Execution hand-off.
        ticket: ExecutionTicket,
    },
    /// Allowed and answered from the replay store. Do not execute.
    Replayed {
        /// The allow.
        decision: Decision,
        /// Ledger index of the decision.
        ledger_idx: u64,
        /// Cached outcome.
        record: ReplayRecord,
    },
    /// Denied. Do not execute.
    Denied {
        /// The denial.
        decision: Decision,
        /// Ledger index of the decision.
        ledger_idx: u64,
    },
}

impl Dispatch {
    /// The gate decision behind this dispatch.
    pub fn decision(&self) -> &Decision {
        match self {
            Self::Execute { decision, .. }
            | Self::Replayed { decision, .. }
            | Self::Denied { decision, .. } => decision,
        }
    }

    /// Ledger index the decision was committed at.
    pub fn ledger_idx(&self) -> u64 {
        match self {
            Self::Execute { ticket, .. } => ticket.ledger_idx,
            Self::Replayed { ledger_idx, .. } | Self::Denied { ledger_idx, .. } => *ledger_idx,
        }
    }

    /// Denial reason, if denied.
    pub fn deny_reason(&self) -> Option<DenyReason> {
        self.decision().reason
    }
}

/// Result of a live execution as reported by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the tool succeeded.
    pub ok: bool,
    /// Short human-readable result.
    #[serde(default)]
    pub summary: String,
    /// Opaque result payload.
    #[serde(default)]
    pub data: Option<Value>,
}

impl ToolOutcome {
    /// A successful outcome.
    pub fn success(summary: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            ok: true,
            summary: summary.into(),
            data,
        }
    }

    /// A failed outcome.
    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            ok: false,
            summary: summary.into(),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Process-wide kernel: shared registry, per-session aggregates.
pub struct Kernel {
    registry: Arc<ToolRegistry>,
    backends: Backends,
    settings: KernelSettings,
    sessions: RwLock<HashMap<String, SessionSlot>>,
    generations: AtomicU64,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("tools", &self.registry.len())
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Kernel over a registry and storage backends.
    pub fn new(registry: Arc<ToolRegistry>, backends: Backends, settings: KernelSettings) -> Self {
        info!(
            tools = registry.len(),
            store = %backends.location,
            "kernel initialised"
        );
        Self {
            registry,
            backends,
            settings,
            sessions: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Shared tool registry.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    // -- Session lifecycle ---------------------------------------------------

    /// Session by id, created (or restored from the catalogue) on first use.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty id or if restoring from storage fails.
    pub async fn session(&self, session_id: &str) -> Result<Arc<Session>, KernelError> {
        if session_id.is_empty() {
            return Err(KernelError::InvalidSessionId(session_id.to_string()));
        }
        let slot = self.slot(session_id).await;
        let session = slot
            .get_or_try_init(|| async { self.load_session(session_id).await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(session))
    }

    /// Table slot for `session_id`, inserted empty if missing. The table lock
    /// is never held across storage I/O.
    async fn slot(&self, session_id: &str) -> SessionSlot {
        if let Some(slot) = self.sessions.read().await.get(session_id) {
            return Arc::clone(slot);
        }
        Arc::clone(
            self.sessions
                .write()
                .await
                .entry(session_id.to_string())
                .or_default(),
        )
    }

    /// Live session with its decision state locked. Skips aggregates retired
    /// by a concurrent teardown.
    async fn locked(&self, session_id: &str) -> Result<(Arc<Session>, OwnedMutexGuard<DecisionState>), KernelError> {
        loop {
            let session = self.session(session_id).await?;
            let state = Arc::clone(&session.state).lock_owned().await;
            if !state.retired {
                return Ok((session, state));
            }
        }
    }

    /// Open a session, generating an id when none is given.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn open_session(&self, session_id: Option<&str>) -> Result<Arc<Session>, KernelError> {
        match session_id {
            Some(id) => self.session(id).await,
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                self.session(&id).await
            }
        }
    }

    async fn load_session(&self, session_id: &str) -> Result<Session, KernelError> {
        let record = match self.backends.catalog.load_session(session_id).await? {
            Some(record) => {
                info!(session = session_id, mode = record.replay_mode.as_str(), "session restored");
                record
            }
            None => {
                let now = gate::now_utc();
                let record = SessionRecord {
                    session_id: session_id.to_string(),
                    working_dir: self.settings.working_dir.clone(),
                    store_location: self.backends.location.clone(),
                    replay_mode: self.settings.default_replay_mode,
                    created_at: now.clone(),
                    updated_at: now,
                };
                self.backends.catalog.save_session(&record).await?;
                info!(session = session_id, "session created");
                record
            }
        };

        let ledger = Ledger::open(session_id, Arc::clone(&self.backends.ledger)).await?;
        let replay = ReplayStore::open(session_id, Arc::clone(&self.backends.replay)).await?;
        let events = EventBus::new(session_id, self.settings.event_buffer);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(&record, generation, ledger, replay, events))
    }

    /// Already-live session, without creating one.
    async fn existing(&self, session_id: &str) -> Result<Arc<Session>, KernelError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|slot| slot.get().cloned())
            .ok_or_else(|| KernelError::SessionNotFound(session_id.to_string()))
    }

    /// Drop a session's in-memory state and catalogue row. Ledger and replay
    /// rows stay; referencing the id again continues the same chain.
    ///
    /// Waits for in-flight proposals on the session to commit first. Tickets
    /// issued before teardown can no longer be completed.
    ///
    /// Returns whether anything existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalogue delete fails; the session stays live then.
    pub async fn teardown(&self, session_id: &str) -> Result<bool, KernelError> {
        let has_slot = self.sessions.read().await.contains_key(session_id);
        if !has_slot {
            let catalogued = self.backends.catalog.delete_session(session_id).await?;
            if catalogued {
                info!(session = session_id, "session torn down");
            }
            return Ok(catalogued);
        }

        let session = self.session(session_id).await?;
        let mut state = session.state.lock().await;
        if state.retired {
            // A concurrent teardown won.
            return Ok(false);
        }
        self.backends.catalog.delete_session(session_id).await?;
        state.retired = true;
        {
            let mut sessions = self.sessions.write().await;
            let same = sessions
                .get(session_id)
                .and_then(|slot| slot.get())
                .is_some_and(|live| Arc::ptr_eq(live, &session));
            if same {
                sessions.remove(session_id);
            }
        }
        drop(state);
        info!(session = session_id, generation = session.generation(), "session torn down");
        Ok(true)
    }

    /// Catalogued sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalogue cannot be read.
    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, KernelError> {
        Ok(self.backends.catalog.list_sessions(limit).await?)
    }

    // -- Decisions -----------------------------------------------------------

    /// Decide a proposal and commit the decision to the ledger.
    ///
    /// Gate evaluation, budget reservation and the ledger append happen under
    /// the session lock, so ledger order equals decision order. If the append
    /// fails the reservation is rolled back and nothing is recorded.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage failures. Denials are `Ok`.
    pub async fn propose(&self, session_id: &str, action: ProposedAction) -> Result<Dispatch, KernelError> {
        let (session, mut guard) = self.locked(session_id).await?;
        let fingerprint = action.fingerprint();
        let state = &mut *guard;
        let mode = state.replay_mode;
        let turn = state.budget.turn();

        let mut decision = gate::evaluate(
            GateContext {
                registry: &self.registry,
                permissions: &state.permissions,
                budget: &mut state.budget,
                replay_mode: mode,
                replay: &session.replay,
            },
            &action,
        );

        // Fetched under the session lock so import/clear cannot race it.
        let mut replayed = None;
        if decision.is_allow() && mode == ReplayMode::Replay {
            replayed = session.replay.lookup(&fingerprint);
            if replayed.is_none() {
                if let Some(reservation) = decision.reservation.take() {
                    state.budget.release(&action.tool, &reservation);
                }
                decision = Decision::deny(
                    DenyReason::ReplayMiss,
                    Some(format!("no replay record for fingerprint {fingerprint}")),
                );
            }
        }

        let payload = ledger_payload(session.id(), &action, &fingerprint, &decision);
        let entry = match session.ledger.append(decision.outcome, payload).await {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(reservation) = decision.reservation.take() {
                    state.budget.release(&action.tool, &reservation);
                }
                error!(
                    session = session.id(),
                    tool = %action.tool,
                    error = %err,
                    "ledger append failed, decision discarded"
                );
                session.events.emit(EventKind::Error {
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };

        debug!(
            session = session.id(),
            tool = %action.tool,
            outcome = decision.outcome.as_str(),
            reason = decision.reason.map(DenyReason::code),
            idx = entry.idx,
            "decision committed"
        );
        session.events.emit(EventKind::DecisionMade {
            tool: action.tool.clone(),
            outcome: decision.outcome,
            reason: decision.reason,
        });
        session.events.emit(EventKind::LedgerAppended {
            idx: entry.idx,
            entry_hash: entry.entry_hash.clone(),
        });

        if let Some(reason) = decision.reason {
            if matches!(
                reason,
                DenyReason::UnknownTool | DenyReason::MalformedArguments | DenyReason::CapabilityDisabled
            ) {
                warn!(
                    session = session.id(),
                    tool = %action.tool,
                    reason = reason.code(),
                    detail = decision.detail.as_deref().unwrap_or(""),
                    "proposal denied"
                );
            }
            session.events.emit(EventKind::Denied {
                tool: action.tool.clone(),
                reason,
            });
            if reason == DenyReason::ReplayMiss {
                session.events.emit(EventKind::ReplayMiss {
                    tool: action.tool,
                    fingerprint,
                });
            }
            return Ok(Dispatch::Denied {
                decision,
                ledger_idx: entry.idx,
            });
        }

        if let Some(record) = replayed {
            session.events.emit(EventKind::ReplayHit {
                tool: action.tool,
                fingerprint,
            });
            return Ok(Dispatch::Replayed {
                decision,
                ledger_idx: entry.idx,
                record,
            });
        }

        session.events.emit(EventKind::ToolInvoked {
            tool: action.tool.clone(),
            fingerprint: fingerprint.clone(),
            ledger_idx: entry.idx,
        });
        let reserved_bytes = decision.reservation.map_or(0, |r| r.bytes);
        Ok(Dispatch::Execute {
            decision,
            ticket: ExecutionTicket {
                session_id: session.id().to_string(),
                session_generation: session.generation(),
                tool: action.tool,
                arguments: action.arguments,
                fingerprint,
                ledger_idx: entry.idx,
                turn,
                reserved_bytes,
                mode,
            },
        })
    }

    /// Report the outcome of a live execution.
    ///
    /// A failure gives back the reserved bytes (the call stays charged). If the
    /// session was recording when the call was allowed, the outcome is stored,
    /// failures included.
    ///
    /// # Errors
    ///
    /// Returns an error if the session was torn down or the record cannot be stored.
    pub async fn complete(&self, ticket: ExecutionTicket, outcome: ToolOutcome) -> Result<(), KernelError> {
        let session = self.existing(&ticket.session_id).await?;
        let mut state = session.state.lock().await;
        if state.retired || session.generation() != ticket.session_generation {
            warn!(
                session = %ticket.session_id,
                tool = %ticket.tool,
                ledger_idx = ticket.ledger_idx,
                "completion for a torn-down session ignored"
            );
            return Err(KernelError::SessionNotFound(ticket.session_id));
        }

        if !outcome.ok {
            state
                .budget
                .release_bytes(&ticket.tool, ticket.turn, ticket.reserved_bytes);
        }
        session.events.emit(EventKind::ToolResult {
            tool: ticket.tool.clone(),
            ok: outcome.ok,
            summary: outcome.summary.clone(),
        });

        if ticket.mode != ReplayMode::Record {
            return Ok(());
        }
        let record = ReplayRecord {
            fingerprint: ticket.fingerprint,
            tool: ticket.tool,
            args: ticket.arguments,
            ok: outcome.ok,
            summary: outcome.summary,
            data: outcome.data,
        };
        let (tool, fingerprint, ok) = (record.tool.clone(), record.fingerprint.clone(), record.ok);
        if let Err(err) = session.replay.store(record).await {
            error!(session = session.id(), tool = %tool, error = %err, "failed to store replay record");
            session.events.emit(EventKind::Error {
                message: err.to_string(),
            });
            return Err(err.into());
        }
        debug!(session = session.id(), tool = %tool, ok, "replay record stored");
        session.events.emit(EventKind::ReplayRecorded {
            tool,
            fingerprint,
            ok,
        });
        Ok(())
    }

    // -- Permissions ---------------------------------------------------------

    /// Grant a tool.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn grant(&self, session_id: &str, tool: &str) -> Result<PermissionSet, KernelError> {
        self.change_grant(session_id, tool, true).await
    }

    /// Revoke a tool.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn revoke(&self, session_id: &str, tool: &str) -> Result<PermissionSet, KernelError> {
        self.change_grant(session_id, tool, false).await
    }

    async fn change_grant(&self, session_id: &str, tool: &str, enabled: bool) -> Result<PermissionSet, KernelError> {
        let (session, mut state) = self.locked(session_id).await?;
        if enabled && self.registry.get(tool).is_none() {
            warn!(session = session_id, tool, "granting a tool that is not registered");
        }
        let changed = if enabled {
            state.permissions.grant(tool)
        } else {
            state.permissions.revoke(tool)
        };
        if changed {
            info!(session = session_id, tool, granted = enabled, "permission changed");
            session.events.emit(EventKind::PermissionChanged {
                tool: Some(tool.to_string()),
                enabled,
            });
        }
        Ok(state.permissions.clone())
    }

    /// Flip the high-risk capability flag.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn set_capability_enabled(&self, session_id: &str, enabled: bool) -> Result<PermissionSet, KernelError> {
        let (session, mut state) = self.locked(session_id).await?;
        if state.permissions.is_capability_enabled() != enabled {
            state.permissions.set_capability_enabled(enabled);
            info!(session = session_id, enabled, "capability flag changed");
            session.events.emit(EventKind::PermissionChanged {
                tool: None,
                enabled,
            });
        }
        Ok(state.permissions.clone())
    }

    /// Current grants and capability flag.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn permissions(&self, session_id: &str) -> Result<PermissionSet, KernelError> {
        let (_session, state) = self.locked(session_id).await?;
        Ok(state.permissions.clone())
    }

    // -- Replay --------------------------------------------------------------

    /// Current replay mode.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn replay_mode(&self, session_id: &str) -> Result<ReplayMode, KernelError> {
        let (_session, state) = self.locked(session_id).await?;
        Ok(state.replay_mode)
    }

    /// Change the replay mode. Persisted in the session catalogue first.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalogue update fails; the mode is unchanged then.
    pub async fn set_replay_mode(&self, session_id: &str, mode: ReplayMode) -> Result<ReplayMode, KernelError> {
        let (session, mut state) = self.locked(session_id).await?;
        if state.replay_mode == mode {
            return Ok(mode);
        }
        self.backends
            .catalog
            .save_session(&session.record(mode, gate::now_utc()))
            .await?;
        state.replay_mode = mode;
        info!(session = session_id, mode = mode.as_str(), "replay mode changed");
        session
            .events
            .emit(EventKind::ReplayModeChanged { mode });
        Ok(mode)
    }

    /// Replay records in write order.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn export_replay(&self, session_id: &str) -> Result<Vec<ReplayRecord>, KernelError> {
        Ok(self.session(session_id).await?.replay.export())
    }

    /// Replay records as newline-delimited JSON.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn export_replay_jsonl(&self, session_id: &str) -> Result<String, KernelError> {
        Ok(self.session(session_id).await?.replay.export_jsonl()?)
    }

    /// Import records, skipping malformed ones.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage failures.
    pub async fn import_replay(&self, session_id: &str, items: Vec<Value>) -> Result<ImportReport, KernelError> {
        let (session, _state) = self.locked(session_id).await?;
        let report = session.replay.import(items).await?;
        info!(session = session_id, imported = report.imported, errors = report.errors.len(), "replay import finished");
        Ok(report)
    }

    /// Import newline-delimited JSON records.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage failures.
    pub async fn import_replay_jsonl(&self, session_id: &str, text: &str) -> Result<ImportReport, KernelError> {
        let (session, _state) = self.locked(session_id).await?;
        let report = session.replay.import_jsonl(text).await?;
        info!(session = session_id, imported = report.imported, errors = report.errors.len(), "replay import finished");
        Ok(report)
    }

    /// Remove all replay records. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend delete fails.
    pub async fn clear_replay(&self, session_id: &str) -> Result<u64, KernelError> {
        let (session, _state) = self.locked(session_id).await?;
        let removed = session.replay.clear().await?;
        info!(session = session_id, removed, "replay records cleared");
        Ok(removed)
    }

    /// Replay records with their count.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn replay_data(&self, session_id: &str) -> Result<ReplayData, KernelError> {
        Ok(self.session(session_id).await?.replay.data())
    }

    // -- Ledger --------------------------------------------------------------

    /// Snapshot of ledger entries in `range`.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn ledger(&self, session_id: &str, range: impl RangeBounds<u64>) -> Result<LedgerView, KernelError> {
        Ok(self.session(session_id).await?.ledger.read(range))
    }

    /// Whether the durable chain verifies.
    ///
    /// # Errors
    ///
    /// Returns an error only if the ledger cannot be read.
    pub async fn verify(&self, session_id: &str) -> Result<bool, KernelError> {
        Ok(self.verify_report(session_id).await?.ok)
    }

    /// Verify the durable chain and report the first defect.
    ///
    /// # Errors
    ///
    /// Returns an error only if the ledger cannot be read.
    pub async fn verify_report(&self, session_id: &str) -> Result<VerifyReport, KernelError> {
        let session = self.session(session_id).await?;
        let report = session.ledger.verify_report().await?;
        if let Some(err) = &report.error {
            warn!(session = session_id, code = ChainError::CODE, error = %err, "ledger verification failed");
        }
        Ok(report)
    }

    // -- Budget --------------------------------------------------------------

    /// Current budget counters.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn budget(&self, session_id: &str) -> Result<BudgetSnapshot, KernelError> {
        let (_session, state) = self.locked(session_id).await?;
        Ok(state.budget.snapshot())
    }

    /// Start a new turn unconditionally. Returns the new turn number.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn new_turn(&self, session_id: &str) -> Result<u64, KernelError> {
        let (_session, mut state) = self.locked(session_id).await?;
        let turn = state.budget.new_turn();
        debug!(session = session_id, turn, "new turn");
        Ok(turn)
    }

    /// Start a new turn only if the current turn is still `observed`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::StaleTurn`] if another caller already advanced.
    pub async fn advance_turn(&self, session_id: &str, observed: u64) -> Result<u64, KernelError> {
        let (_session, mut state) = self.locked(session_id).await?;
        let current = state.budget.turn();
        if current != observed {
            return Err(KernelError::StaleTurn { observed, current });
        }
        let turn = state.budget.new_turn();
        debug!(session = session_id, turn, "new turn");
        Ok(turn)
    }

    // -- Observation ---------------------------------------------------------

    /// Describe a session.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn world(&self, session_id: &str) -> Result<WorldDescriptor, KernelError> {
        let (session, state) = self.locked(session_id).await?;
        let perms = &state.permissions;
        let replaying = state.replay_mode == ReplayMode::Replay;
        let enabled_tools = self
            .registry
            .iter()
            .filter(|d| !d.require_grant || perms.is_granted(&d.name))
            .filter(|d| !self.registry.is_capability(&d.name) || perms.is_capability_enabled())
            .filter(|d| !(replaying && d.deny_in_replay))
            .map(|d| d.name.clone())
            .collect();
        Ok(WorldDescriptor {
            session_id: session.id().to_string(),
            working_dir: session.working_dir().to_string(),
            store_location: session.store_location().to_string(),
            replay_mode: state.replay_mode,
            enabled_tools,
            granted_permissions: perms.granted().map(str::to_string).collect(),
            capability_enabled: perms.is_capability_enabled(),
            turn: state.budget.turn(),
            ledger_entries: session.ledger.len(),
            replay_records: session.replay.len(),
            created_at: session.created_at().to_string(),
        })
    }

    /// Observe a session's events from now on.
    ///
    /// # Errors
    ///
    /// See [`Kernel::session`].
    pub async fn subscribe(&self, session_id: &str) -> Result<EventSubscription, KernelError> {
        Ok(self.session(session_id).await?.events.subscribe())
    }
}

/// Ledger payload: the action as proposed plus the decision.
fn ledger_payload(session_id: &str, action: &ProposedAction, fingerprint: &str, decision: &Decision) -> Value {
    json!({
        "session_id": session_id,
        "action": action,
        "fingerprint": fingerprint,
        "decision": decision,
    })
}
