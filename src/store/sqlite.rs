//! SQLite backend.
//!
//! Writes go straight to the pool. The ledger is already serialized per
//! session by the kernel and the primary key on `(session_id, idx)` turns any
//! racing duplicate into an error instead of a fork in the chain.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::{LedgerBackend, ReplayBackend, SessionCatalog, SessionRecord, StoreError};
use crate::kernel::gate::Outcome;
use crate::kernel::ledger::LedgerEntry;
use crate::kernel::replay::{ReplayMode, ReplayRecord};

const SCHEMA: &str = include_str!("../../migrations/001_schema.sql");

/// Pool size for file-backed databases.
const MAX_CONNECTIONS: u32 = 4;

/// SQLite-backed ledger, replay and session storage.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a database file and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, the file
    /// cannot be opened, or the schema fails to apply.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(opts)
            .await?;
        info!(path = %path.display(), "sqlite store opened");
        Self::from_pool(pool).await
    }

    /// Private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        // In-memory databases are per-connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn from_pool(db: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&db).await?;
        Ok(Self { db })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(field: &'static str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

type LedgerRow = (i64, String, String, String, String, String);

#[async_trait]
impl LedgerBackend for SqliteStore {
    async fn append_entry(&self, session_id: &str, entry: &LedgerEntry) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&entry.payload)?;
        sqlx::query(
            "INSERT INTO ledger_entries \
             (session_id, idx, ts_utc, decision, payload, prev_entry_hash, entry_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(session_id)
        .bind(to_i64(entry.idx))
        .bind(&entry.ts_utc)
        .bind(entry.decision.as_str())
        .bind(payload)
        .bind(&entry.prev_entry_hash)
        .bind(&entry.entry_hash)
        .execute(&self.db)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::DuplicateIndex {
                    session_id: session_id.to_string(),
                    idx: entry.idx,
                }
            }
            other => StoreError::Database(other),
        })?;

        debug!(session_id, idx = entry.idx, "ledger entry persisted");
        Ok(())
    }

    async fn load_entries(&self, session_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT idx, ts_utc, decision, payload, prev_entry_hash, entry_hash \
             FROM ledger_entries WHERE session_id = ?1 ORDER BY idx ASC",
        )
        .bind(session_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: LedgerRow) -> Result<LedgerEntry, StoreError> {
    let (idx, ts_utc, decision, payload, prev_entry_hash, entry_hash) = row;
    let Some(outcome) = Outcome::parse(&decision) else {
        return Err(StoreError::InvalidValue {
            field: "decision",
            value: decision,
        });
    };
    Ok(LedgerEntry {
        idx: to_u64("idx", idx)?,
        ts_utc,
        decision: outcome,
        payload: serde_json::from_str(&payload)?,
        prev_entry_hash,
        entry_hash,
    })
}

// ---------------------------------------------------------------------------
// Replay records
// ---------------------------------------------------------------------------

type ReplayRow = (String, String, String, bool, String, Option<String>);

#[async_trait]
impl ReplayBackend for SqliteStore {
    async fn put_record(&self, session_id: &str, record: &ReplayRecord) -> Result<(), StoreError> {
        let args = serde_json::to_string(&record.args)?;
        let data = record
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO replay_records \
             (session_id, fingerprint, seq, tool, args, ok, summary, data) \
             VALUES (?1, ?2, \
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM replay_records WHERE session_id = ?1), \
                     ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(session_id, fingerprint) DO UPDATE SET \
                 seq = excluded.seq, tool = excluded.tool, args = excluded.args, \
                 ok = excluded.ok, summary = excluded.summary, data = excluded.data",
        )
        .bind(session_id)
        .bind(&record.fingerprint)
        .bind(&record.tool)
        .bind(args)
        .bind(record.ok)
        .bind(&record.summary)
        .bind(data)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn load_records(&self, session_id: &str) -> Result<Vec<ReplayRecord>, StoreError> {
        let rows: Vec<ReplayRow> = sqlx::query_as(
            "SELECT fingerprint, tool, args, ok, summary, data \
             FROM replay_records WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn clear_records(&self, session_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM replay_records WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: ReplayRow) -> Result<ReplayRecord, StoreError> {
    let (fingerprint, tool, args, ok, summary, data) = row;
    Ok(ReplayRecord {
        fingerprint,
        tool,
        args: serde_json::from_str(&args)?,
        ok,
        summary,
        data: data
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?,
    })
}

// ---------------------------------------------------------------------------
// Session catalogue
// ---------------------------------------------------------------------------

type SessionRow = (String, String, String, String, String, String);

fn session_from_row(row: SessionRow) -> Result<SessionRecord, StoreError> {
    let (session_id, working_dir, store_location, mode, created_at, updated_at) = row;
    let replay_mode = mode.parse::<ReplayMode>().map_err(|_| StoreError::InvalidValue {
        field: "replay_mode",
        value: mode.clone(),
    })?;
    Ok(SessionRecord {
        session_id,
        working_dir,
        store_location,
        replay_mode,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl SessionCatalog for SqliteStore {
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions \
             (session_id, working_dir, store_location, replay_mode, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(session_id) DO UPDATE SET \
                 working_dir = excluded.working_dir, \
                 store_location = excluded.store_location, \
                 replay_mode = excluded.replay_mode, \
                 updated_at = excluded.updated_at",
        )
        .bind(&record.session_id)
        .bind(&record.working_dir)
        .bind(&record.store_location)
        .bind(record.replay_mode.as_str())
        .bind(&record.created_at)
        .bind(&record.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT session_id, working_dir, store_location, replay_mode, created_at, updated_at \
             FROM sessions WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(session_from_row).transpose()
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT session_id, working_dir, store_location, replay_mode, created_at, updated_at \
             FROM sessions ORDER BY created_at DESC, session_id ASC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }
}
