//! Append-only, hash-chained decision ledger.
//!
//! Every gate decision becomes one [`LedgerEntry`]:
//!
//! ```text
//! entry_hash = sha256(canonical({decision, idx, payload, prev_entry_hash, ts_utc}))
//! ```
//!
//! where `prev_entry_hash` is the previous entry's hash, or [`GENESIS_HASH`]
//! for `idx == 0`. Editing any committed field breaks that entry's hash, and
//! because the next entry embeds it, every later link too.
//!
//! Appends are serialized per ledger and hit the backend before the in-memory
//! copy, so a failed append leaves both unchanged. If the backend reports the
//! index as taken, the in-memory copy is reloaded from the backend.

use std::ops::{Bound, RangeBounds};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use super::gate::{now_utc, Outcome};
use crate::canonical::{self, GENESIS_HASH};
use crate::store::{LedgerBackend, StoreError};

/// One committed decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Zero-based position, contiguous per session.
    pub idx: u64,
    /// RFC 3339 append time.
    pub ts_utc: String,
    /// Gate outcome.
    pub decision: Outcome,
    /// Action descriptor plus decision detail.
    pub payload: Value,
    /// Hash of the previous entry, or the genesis constant.
    pub prev_entry_hash: String,
    /// Hash over this entry's other fields.
    pub entry_hash: String,
}

impl LedgerEntry {
    /// Recompute this entry's hash from its other fields.
    pub fn recompute_hash(&self) -> String {
        entry_hash(
            self.idx,
            &self.ts_utc,
            self.decision,
            &self.prev_entry_hash,
            &self.payload,
        )
    }
}

/// Hash of an entry's committed fields.
pub fn entry_hash(idx: u64, ts_utc: &str, decision: Outcome, prev_entry_hash: &str, payload: &Value) -> String {
    canonical::hash_value(&json!({
        "decision": decision.as_str(),
        "idx": idx,
        "payload": payload,
        "prev_entry_hash": prev_entry_hash,
        "ts_utc": ts_utc,
    }))
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// First defect found while walking a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainError {
    /// The entry at `position` does not carry `idx == position`.
    #[error("index gap at position {position}: found idx {found}")]
    IndexGap {
        /// Expected index.
        position: u64,
        /// Index actually stored.
        found: u64,
    },

    /// `prev_entry_hash` does not equal the previous entry's hash.
    #[error("prev_entry_hash mismatch at idx {idx}")]
    PrevHashMismatch {
        /// Offending entry.
        idx: u64,
    },

    /// `entry_hash` does not equal the recomputation.
    #[error("entry_hash mismatch at idx {idx}")]
    EntryHashMismatch {
        /// Offending entry.
        idx: u64,
    },

    /// A hash field is not 64 lowercase hex characters.
    #[error("malformed hash at idx {idx}")]
    MalformedHash {
        /// Offending entry.
        idx: u64,
    },
}

impl ChainError {
    /// Error code shared by every chain defect.
    pub const CODE: &'static str = "chain_verification_failed";

    /// Index at which verification stopped.
    pub fn idx(&self) -> u64 {
        match self {
            Self::IndexGap { position, .. } => *position,
            Self::PrevHashMismatch { idx }
            | Self::EntryHashMismatch { idx }
            | Self::MalformedHash { idx } => *idx,
        }
    }
}

/// Walk `entries` from genesis, stopping at the first defect.
///
/// # Errors
///
/// Returns the first [`ChainError`] found. On success returns the entry count.
pub fn verify_chain<'a, I>(entries: I) -> Result<u64, ChainError>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut position: u64 = 0;
    for entry in entries {
        if entry.idx != position {
            return Err(ChainError::IndexGap {
                position,
                found: entry.idx,
            });
        }
        if !canonical::is_hex_digest(&entry.entry_hash)
            || !canonical::is_hex_digest(&entry.prev_entry_hash)
        {
            return Err(ChainError::MalformedHash { idx: entry.idx });
        }
        if entry.prev_entry_hash != expected_prev {
            return Err(ChainError::PrevHashMismatch { idx: entry.idx });
        }
        if entry.recompute_hash() != entry.entry_hash {
            return Err(ChainError::EntryHashMismatch { idx: entry.idx });
        }
        expected_prev.clone_from(&entry.entry_hash);
        position = position.saturating_add(1);
    }
    Ok(position)
}

/// Outcome of a full verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Whether the whole chain is intact.
    pub ok: bool,
    /// Entries checked before stopping.
    pub entries: u64,
    /// First defect, if any.
    pub error: Option<ChainError>,
}

impl VerifyReport {
    fn from_result(total: usize, result: Result<u64, ChainError>) -> Self {
        match result {
            Ok(entries) => Self {
                ok: true,
                entries,
                error: None,
            },
            Err(error) => Self {
                ok: false,
                entries: error.idx().min(u64::try_from(total).unwrap_or(u64::MAX)),
                error: Some(error),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// One session's chain.
pub struct Ledger {
    session_id: String,
    backend: Arc<dyn LedgerBackend>,
    entries: RwLock<Vec<Arc<LedgerEntry>>>,
    append_lock: Mutex<()>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("session_id", &self.session_id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Load a session's chain from the backend. The loaded chain is not
    /// verified here; call [`Ledger::verify`] for that.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub async fn open(session_id: &str, backend: Arc<dyn LedgerBackend>) -> Result<Self, StoreError> {
        let entries = backend
            .load_entries(session_id)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        Ok(Self {
            session_id: session_id.to_string(),
            backend,
            entries: RwLock::new(entries),
            append_lock: Mutex::new(()),
        })
    }

    /// Compute, persist and cache the next entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the entry. Nothing is cached then.
    pub async fn append(&self, decision: Outcome, payload: Value) -> Result<Arc<LedgerEntry>, StoreError> {
        let _guard = self.append_lock.lock().await;

        let (idx, prev_entry_hash) = {
            let entries = self.read_entries();
            let idx = u64::try_from(entries.len()).unwrap_or(u64::MAX);
            let prev = entries
                .last()
                .map_or_else(|| GENESIS_HASH.to_string(), |e| e.entry_hash.clone());
            (idx, prev)
        };
        let ts_utc = now_utc();
        let hash = entry_hash(idx, &ts_utc, decision, &prev_entry_hash, &payload);
        let entry = Arc::new(LedgerEntry {
            idx,
            ts_utc,
            decision,
            payload,
            prev_entry_hash,
            entry_hash: hash,
        });

        if let Err(err) = self.backend.append_entry(&self.session_id, &entry).await {
            if matches!(err, StoreError::DuplicateIndex { .. }) {
                // Another writer extended the stored chain. Adopt it so the
                // next append links to the real head.
                self.resync().await;
            }
            return Err(err);
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&entry));
        Ok(entry)
    }

    async fn resync(&self) {
        match self.backend.load_entries(&self.session_id).await {
            Ok(stored) => {
                let len = stored.len();
                *self.entries.write().unwrap_or_else(PoisonError::into_inner) =
                    stored.into_iter().map(Arc::new).collect();
                warn!(session = %self.session_id, entries = len, "ledger reloaded after a concurrent append");
            }
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "ledger reload failed");
            }
        }
    }

    /// Snapshot of the entries whose `idx` falls in `range`.
    ///
    /// Entries appended after the call are not included.
    pub fn read(&self, range: impl RangeBounds<u64>) -> LedgerView {
        let entries = self.read_entries();
        let len = entries.len();
        let start = match range.start_bound() {
            Bound::Included(s) => to_index(*s),
            Bound::Excluded(s) => to_index(s.saturating_add(1)),
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(e) => to_index(e.saturating_add(1)),
            Bound::Excluded(e) => to_index(*e),
            Bound::Unbounded => len,
        }
        .clamp(start, len);
        let slice = entries.get(start..end).unwrap_or_default().to_vec();
        LedgerView {
            inner: slice.into_iter(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        u64::try_from(self.read_entries().len()).unwrap_or(u64::MAX)
    }

    /// Whether no decision has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Hash the next entry will chain to.
    pub fn head_hash(&self) -> String {
        self.read_entries()
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |e| e.entry_hash.clone())
    }

    /// Verify the durable chain.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backend cannot be read.
    pub async fn verify(&self) -> Result<bool, StoreError> {
        Ok(self.verify_report().await?.ok)
    }

    /// Verify the durable chain and report the first defect.
    ///
    /// Reads the backend rather than the in-memory copy so out-of-band edits
    /// to stored rows are caught.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backend cannot be read.
    pub async fn verify_report(&self) -> Result<VerifyReport, StoreError> {
        let stored = self.backend.load_entries(&self.session_id).await?;
        Ok(VerifyReport::from_result(stored.len(), verify_chain(&stored)))
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, Vec<Arc<LedgerEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_index(idx: u64) -> usize {
    usize::try_from(idx).unwrap_or(usize::MAX)
}

/// Lazily consumed snapshot of ledger entries.
#[derive(Debug)]
pub struct LedgerView {
    inner: std::vec::IntoIter<Arc<LedgerEntry>>,
}

impl Iterator for LedgerView {
    type Item = Arc<LedgerEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for LedgerView {}
