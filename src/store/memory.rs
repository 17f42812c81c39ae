//! In-process backend for tests and ephemeral kernels.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{LedgerBackend, ReplayBackend, SessionCatalog, SessionRecord, StoreError};
use crate::kernel::ledger::LedgerEntry;
use crate::kernel::replay::ReplayRecord;

#[derive(Debug, Default)]
struct Inner {
    ledgers: HashMap<String, Vec<LedgerEntry>>,
    /// Write order is the vector order; re-recording moves a record to the end.
    replay: HashMap<String, Vec<ReplayRecord>>,
    sessions: HashMap<String, SessionRecord>,
}

/// Everything behind one mutex. No await happens while it is held.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl LedgerBackend for MemoryStore {
    async fn append_entry(&self, session_id: &str, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let entries = inner.ledgers.entry(session_id.to_string()).or_default();
        if entries.iter().any(|e| e.idx == entry.idx) {
            return Err(StoreError::DuplicateIndex {
                session_id: session_id.to_string(),
                idx: entry.idx,
            });
        }
        entries.push(entry.clone());
        Ok(())
    }

    async fn load_entries(&self, session_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        let inner = self.lock()?;
        let mut entries = inner.ledgers.get(session_id).cloned().unwrap_or_default();
        entries.sort_by_key(|e| e.idx);
        Ok(entries)
    }
}

#[async_trait]
impl ReplayBackend for MemoryStore {
    async fn put_record(&self, session_id: &str, record: &ReplayRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let records = inner.replay.entry(session_id.to_string()).or_default();
        records.retain(|r| r.fingerprint != record.fingerprint);
        records.push(record.clone());
        Ok(())
    }

    async fn load_records(&self, session_id: &str) -> Result<Vec<ReplayRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.replay.get(session_id).cloned().unwrap_or_default())
    }

    async fn clear_records(&self, session_id: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        let removed = inner.replay.remove(session_id).map_or(0, |r| r.len());
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl SessionCatalog for MemoryStore {
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.lock()?.sessions.get(session_id).cloned())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.sessions.remove(session_id).is_some())
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
        let inner = self.lock()?;
        let mut sessions: Vec<SessionRecord> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions.truncate(limit);
        Ok(sessions)
    }
}
