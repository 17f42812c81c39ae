//! Record/replay cache keyed by fingerprint.
//!
//! In `record` mode every completed live execution is stored, failures
//! included. In `replay` mode the kernel answers allowed proposals from the
//! cache and never executes. The backend is written before the in-memory index
//! so a failed write leaves no trace.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use crate::canonical;
use crate::store::{ReplayBackend, StoreError};

/// Per-session replay mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Live execution, nothing recorded.
    #[default]
    Off,
    /// Live execution, outcomes recorded.
    Record,
    /// No live execution, outcomes served from records.
    Replay,
}

impl ReplayMode {
    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Record => "record",
            Self::Replay => "replay",
        }
    }
}

/// A replay mode string that is not `off`, `record` or `replay`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid replay mode {0:?}: expected off, record or replay")]
pub struct InvalidReplayMode(pub String);

impl FromStr for ReplayMode {
    type Err = InvalidReplayMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "record" => Ok(Self::Record),
            "replay" => Ok(Self::Replay),
            other => Err(InvalidReplayMode(other.to_string())),
        }
    }
}

/// Stable hash of a tool call: `sha256(canonical({"args": args, "tool": tool}))`.
pub fn fingerprint(tool: &str, args: &Value) -> String {
    canonical::hash_value(&json!({ "args": args, "tool": tool }))
}

/// One recorded tool outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    /// Fingerprint of `(tool, args)`.
    #[serde(alias = "action_id")]
    pub fingerprint: String,
    /// Tool name.
    pub tool: String,
    /// Arguments as proposed.
    pub args: Value,
    /// Whether the execution succeeded.
    pub ok: bool,
    /// Short human-readable result.
    #[serde(default)]
    pub summary: String,
    /// Opaque result payload.
    #[serde(default)]
    pub data: Option<Value>,
}

impl ReplayRecord {
    /// Record for `(tool, args)` with the fingerprint computed.
    pub fn new(tool: &str, args: Value, ok: bool, summary: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            fingerprint: fingerprint(tool, &args),
            tool: tool.to_string(),
            args,
            ok,
            summary: summary.into(),
            data,
        }
    }
}

/// One rejected import item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("import_parse_error at item {index}: {reason}")]
pub struct ImportError {
    /// Zero-based position of the item in the input.
    pub index: usize,
    /// What was wrong with it.
    pub reason: String,
}

impl ImportError {
    /// Stable error code shared by every import failure.
    pub const CODE: &'static str = "import_parse_error";
}

/// Outcome of a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Records stored.
    pub imported: usize,
    /// Items skipped, in input order.
    pub errors: Vec<ImportError>,
}

/// Records plus their count, as served to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayData {
    /// Number of records.
    pub record_count: usize,
    /// Records in write order.
    pub records: Vec<ReplayRecord>,
}

#[derive(Debug, Default)]
struct Index {
    records: HashMap<String, (u64, ReplayRecord)>,
    next_seq: u64,
}

/// Replay records of one session.
pub struct ReplayStore {
    session_id: String,
    backend: Arc<dyn ReplayBackend>,
    index: RwLock<Index>,
    /// Serializes backend writes so backend and index agree on order.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for ReplayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayStore")
            .field("session_id", &self.session_id)
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

impl ReplayStore {
    /// Load a session's records from the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub async fn open(session_id: &str, backend: Arc<dyn ReplayBackend>) -> Result<Self, StoreError> {
        let mut index = Index::default();
        for record in backend.load_records(session_id).await? {
            index.insert(record);
        }
        Ok(Self {
            session_id: session_id.to_string(),
            backend,
            index: RwLock::new(index),
            write_lock: Mutex::new(()),
        })
    }

    /// Record for a fingerprint, if stored.
    pub fn lookup(&self, fingerprint: &str) -> Option<ReplayRecord> {
        self.read_index()
            .records
            .get(fingerprint)
            .map(|(_, r)| r.clone())
    }

    /// Whether a record with this fingerprint is stored.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.read_index().records.contains_key(fingerprint)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.read_index().records.len()
    }

    /// Whether no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store or replace a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails. The index is untouched then.
    pub async fn store(&self, record: ReplayRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.backend.put_record(&self.session_id, &record).await?;
        self.write_index().insert(record);
        Ok(())
    }

    /// Records in write order.
    pub fn export(&self) -> Vec<ReplayRecord> {
        let index = self.read_index();
        let mut ordered: Vec<&(u64, ReplayRecord)> = index.records.values().collect();
        ordered.sort_by_key(|(seq, _)| *seq);
        ordered.into_iter().map(|(_, r)| r.clone()).collect()
    }

    /// Records in write order, one JSON object per line.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be serialized.
    pub fn export_jsonl(&self) -> Result<String, StoreError> {
        let mut out = String::new();
        for record in self.export() {
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Import parsed items one at a time, skipping malformed ones.
    ///
    /// A missing fingerprint is computed. A present one must match the
    /// recomputed fingerprint of `(tool, args)`.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage failures. Items stored before the
    /// failure stay stored.
    pub async fn import(&self, items: Vec<Value>) -> Result<ImportReport, StoreError> {
        let mut report = ImportReport::default();
        for (index, item) in items.into_iter().enumerate() {
            match validate_item(item) {
                Ok(record) => {
                    self.store(record).await?;
                    report.imported = report.imported.saturating_add(1);
                }
                Err(reason) => {
                    warn!(session = %self.session_id, index, %reason, "skipping replay import item");
                    report.errors.push(ImportError { index, reason });
                }
            }
        }
        Ok(report)
    }

    /// Import newline-delimited JSON. Blank lines are ignored; a line that is
    /// not JSON is reported under its zero-based line number.
    ///
    /// # Errors
    ///
    /// See [`ReplayStore::import`].
    pub async fn import_jsonl(&self, text: &str) -> Result<ImportReport, StoreError> {
        let mut report = ImportReport::default();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<Value>(line)
                .map_err(|e| format!("invalid JSON: {e}"))
                .and_then(validate_item);
            match parsed {
                Ok(record) => {
                    self.store(record).await?;
                    report.imported = report.imported.saturating_add(1);
                }
                Err(reason) => {
                    warn!(session = %self.session_id, line = index, %reason, "skipping replay import line");
                    report.errors.push(ImportError { index, reason });
                }
            }
        }
        Ok(report)
    }

    /// Remove every record. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend delete fails.
    pub async fn clear(&self) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let removed = self.backend.clear_records(&self.session_id).await?;
        let mut index = self.write_index();
        index.records.clear();
        Ok(removed)
    }

    /// Records with their count.
    pub fn data(&self) -> ReplayData {
        let records = self.export();
        ReplayData {
            record_count: records.len(),
            records,
        }
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Index {
    fn insert(&mut self, record: ReplayRecord) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.records.insert(record.fingerprint.clone(), (seq, record));
    }
}

fn validate_item(item: Value) -> Result<ReplayRecord, String> {
    let Value::Object(mut map) = item else {
        return Err("record must be a JSON object".to_string());
    };
    let tool = match map.get("tool") {
        Some(Value::String(t)) if !t.is_empty() => t.clone(),
        _ => return Err("missing or empty 'tool'".to_string()),
    };
    let args = map
        .remove("args")
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    if !args.is_object() {
        return Err("'args' must be an object".to_string());
    }
    let expected = fingerprint(&tool, &args);
    let given = map
        .get("fingerprint")
        .or_else(|| map.get("action_id"))
        .cloned();
    match given {
        None | Some(Value::Null) => {}
        Some(Value::String(fp)) if fp == expected => {}
        Some(Value::String(fp)) => {
            return Err(format!("fingerprint {fp} does not match tool and args"));
        }
        Some(_) => return Err("'fingerprint' must be a string".to_string()),
    }
    let ok = match map.get("ok") {
        Some(Value::Bool(b)) => *b,
        _ => return Err("missing or non-boolean 'ok'".to_string()),
    };
    let summary = match map.get("summary") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err("'summary' must be a string".to_string()),
    };
    let data = match map.remove("data") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v),
    };
    Ok(ReplayRecord {
        fingerprint: expected,
        tool,
        args,
        ok,
        summary,
        data,
    })
}
