//! Storage backends for ledgers, replay records and the session catalogue.
//!
//! The kernel only needs an append-only log and a keyed record store. Both
//! are traits so the in-memory backend ([`MemoryStore`]) and the SQLite backend
//! ([`SqliteStore`]) are interchangeable.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::kernel::ledger::LedgerEntry;
use crate::kernel::replay::{ReplayMode, ReplayRecord};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Operational storage failures. Never produced for policy outcomes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Creating the database directory failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored JSON column could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A ledger index for this session is already taken.
    #[error("ledger index {idx} already exists for session {session_id}")]
    DuplicateIndex {
        /// Session id.
        session_id: String,
        /// Conflicting index.
        idx: u64,
    },

    /// A row holds a value the kernel never writes.
    #[error("invalid {field} value: {value:?}")]
    InvalidValue {
        /// Column name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// An in-process lock was poisoned by a panicking holder.
    #[error("store lock poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Session catalogue
// ---------------------------------------------------------------------------

/// Persisted session metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id.
    pub session_id: String,
    /// Working directory the session acts in.
    pub working_dir: String,
    /// Where the session's durable state lives.
    pub store_location: String,
    /// Last replay mode set.
    pub replay_mode: ReplayMode,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last metadata change.
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Backend traits
// ---------------------------------------------------------------------------

/// Durable append-only ledger storage.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Durably add one entry. Must reject an `idx` already stored for the session.
    async fn append_entry(&self, session_id: &str, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// All entries of a session ordered by `idx`.
    async fn load_entries(&self, session_id: &str) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// Durable replay record storage keyed by `(session, fingerprint)`.
#[async_trait]
pub trait ReplayBackend: Send + Sync {
    /// Insert or replace the record with the same fingerprint.
    async fn put_record(&self, session_id: &str, record: &ReplayRecord) -> Result<(), StoreError>;

    /// All records of a session, oldest write first.
    async fn load_records(&self, session_id: &str) -> Result<Vec<ReplayRecord>, StoreError>;

    /// Remove every record of a session. Returns how many were removed.
    async fn clear_records(&self, session_id: &str) -> Result<u64, StoreError>;
}

/// Session metadata storage.
#[async_trait]
pub trait SessionCatalog: Send + Sync {
    /// Insert or update a session row.
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Load one session row.
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Remove a session row. Returns whether it existed.
    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Most recently created sessions first.
    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError>;
}

/// The three backends a kernel needs, usually all the same store.
#[derive(Clone)]
pub struct Backends {
    /// Ledger storage.
    pub ledger: Arc<dyn LedgerBackend>,
    /// Replay record storage.
    pub replay: Arc<dyn ReplayBackend>,
    /// Session metadata storage.
    pub catalog: Arc<dyn SessionCatalog>,
    /// Human-readable location recorded on each session.
    pub location: String,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl Backends {
    /// Use one store for all three concerns.
    pub fn from_store<S>(store: Arc<S>, location: impl Into<String>) -> Self
    where
        S: LedgerBackend + ReplayBackend + SessionCatalog + 'static,
    {
        Self {
            ledger: store.clone(),
            replay: store.clone(),
            catalog: store,
            location: location.into(),
        }
    }

    /// Fresh in-memory store, nothing survives the process.
    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(MemoryStore::new()), "memory")
    }
}
