//! Session aggregate.
//!
//! A session owns its ledger, replay store, permissions, budget and event bus.
//! The mutable decision state sits behind one async mutex that the kernel holds
//! from gate evaluation through the durable ledger append. Teardown takes the
//! same mutex and marks the state retired, so work on a torn-down aggregate
//! either finished before it or never starts.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use super::budget::BudgetTracker;
use super::events::EventBus;
use super::ledger::Ledger;
use super::permissions::PermissionSet;
use super::replay::{ReplayMode, ReplayStore};
use crate::store::SessionRecord;

/// State the gate reads and the budget it charges.
#[derive(Debug, Default)]
pub(crate) struct DecisionState {
    pub(crate) permissions: PermissionSet,
    pub(crate) budget: BudgetTracker,
    pub(crate) replay_mode: ReplayMode,
    /// Set once by teardown. A retired aggregate accepts no more work.
    pub(crate) retired: bool,
}

/// One live session.
#[derive(Debug)]
pub struct Session {
    id: String,
    working_dir: String,
    store_location: String,
    created_at: String,
    generation: u64,
    pub(crate) state: Arc<Mutex<DecisionState>>,
    pub(crate) ledger: Ledger,
    pub(crate) replay: ReplayStore,
    pub(crate) events: EventBus,
}

impl Session {
    pub(crate) fn new(
        record: &SessionRecord,
        generation: u64,
        ledger: Ledger,
        replay: ReplayStore,
        events: EventBus,
    ) -> Self {
        Self {
            id: record.session_id.clone(),
            working_dir: record.working_dir.clone(),
            store_location: record.store_location.clone(),
            created_at: record.created_at.clone(),
            generation,
            state: Arc::new(Mutex::new(DecisionState {
                replay_mode: record.replay_mode,
                ..DecisionState::default()
            })),
            ledger,
            replay,
            events,
        }
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Working directory recorded at creation.
    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    /// Where the session's durable state lives.
    pub fn store_location(&self) -> &str {
        &self.store_location
    }

    /// RFC 3339 creation time.
    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// Kernel-unique number of this aggregate. A session id reused after
    /// teardown gets a new generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read-only access to the ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Read-only access to the replay store.
    pub fn replay(&self) -> &ReplayStore {
        &self.replay
    }

    /// Catalogue row for this session with the given mode and update time.
    pub(crate) fn record(&self, replay_mode: ReplayMode, updated_at: String) -> SessionRecord {
        SessionRecord {
            session_id: self.id.clone(),
            working_dir: self.working_dir.clone(),
            store_location: self.store_location.clone(),
            replay_mode,
            created_at: self.created_at.clone(),
            updated_at,
        }
    }
}

/// Description of a session for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorldDescriptor {
    /// Session id.
    pub session_id: String,
    /// Working directory.
    pub working_dir: String,
    /// Durable state location.
    pub store_location: String,
    /// Current replay mode.
    pub replay_mode: ReplayMode,
    /// Tools a proposal could currently be allowed for, ignoring budget.
    pub enabled_tools: Vec<String>,
    /// Explicitly granted tools.
    pub granted_permissions: Vec<String>,
    /// Capability flag.
    pub capability_enabled: bool,
    /// Current turn.
    pub turn: u64,
    /// Ledger length.
    pub ledger_entries: u64,
    /// Replay record count.
    pub replay_records: usize,
    /// RFC 3339 creation time.
    pub created_at: String,
}
