//! Entitlement store: the local, queryable copy of subscription state.
//!
//! Rows are keyed by wallet address and never deleted. The reconciler reads all rows and
//! writes changed ones back in a single batch; the wallet-link and manual-upgrade paths
//! write single rows. Concurrent writers resolve last-writer-wins per row.

use crate::tier::Tier;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Join(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Believed subscription state for one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementRecord {
    pub address: String,
    pub tier: Tier,
    pub expires_at: u64,
    pub linked_at: u64,
    /// Last time the reconciler changed this row.
    pub last_synced_at: Option<u64>,
}

impl EntitlementRecord {
    pub fn free(address: impl Into<String>, linked_at: u64) -> Self {
        Self {
            address: address.into(),
            tier: Tier::Free,
            expires_at: 0,
            linked_at,
            last_synced_at: None,
        }
    }

    /// Tier in force at `now`: the stored tier until it expires, then `Free`.
    pub fn effective_tier(&self, now: u64) -> Tier {
        if self.tier.is_paid() && self.expires_at > now {
            self.tier
        } else {
            Tier::Free
        }
    }

    pub fn is_premium(&self, now: u64) -> bool {
        self.effective_tier(now).is_paid()
    }

    /// Daily query allowance at `now`; `None` is unlimited. Falls to the Free allowance
    /// once the paid period lapses.
    pub fn daily_query_limit(&self, now: u64) -> Option<u32> {
        self.effective_tier(now).daily_query_limit()
    }
}

/// One row write produced by a reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowUpdate {
    pub address: String,
    pub tier: Tier,
    pub expires_at: u64,
    pub synced_at: u64,
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Create a `Free` row for `address` if none exists; return the row.
    async fn link_wallet(&self, address: &str, now: u64) -> Result<EntitlementRecord, StoreError>;

    /// Overwrite tier and expiry directly, creating the row if needed.
    async fn manual_upgrade(
        &self,
        address: &str,
        tier: Tier,
        expires_at: u64,
        now: u64,
    ) -> Result<EntitlementRecord, StoreError>;

    async fn get(&self, address: &str) -> Result<Option<EntitlementRecord>, StoreError>;

    /// All linked rows, ordered by address.
    async fn linked_records(&self) -> Result<Vec<EntitlementRecord>, StoreError>;

    /// Write every update or none. Returns the number of rows written.
    async fn apply_batch(&self, updates: Vec<RowUpdate>) -> Result<usize, StoreError>;
}

#[async_trait]
impl<T: EntitlementStore + ?Sized> EntitlementStore for Arc<T> {
    async fn link_wallet(&self, address: &str, now: u64) -> Result<EntitlementRecord, StoreError> {
        (**self).link_wallet(address, now).await
    }

    async fn manual_upgrade(
        &self,
        address: &str,
        tier: Tier,
        expires_at: u64,
        now: u64,
    ) -> Result<EntitlementRecord, StoreError> {
        (**self).manual_upgrade(address, tier, expires_at, now).await
    }

    async fn get(&self, address: &str) -> Result<Option<EntitlementRecord>, StoreError> {
        (**self).get(address).await
    }

    async fn linked_records(&self) -> Result<Vec<EntitlementRecord>, StoreError> {
        (**self).linked_records().await
    }

    async fn apply_batch(&self, updates: Vec<RowUpdate>) -> Result<usize, StoreError> {
        (**self).apply_batch(updates).await
    }
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<BTreeMap<String, EntitlementRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn link_wallet(&self, address: &str, now: u64) -> Result<EntitlementRecord, StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(rows
            .entry(address.to_string())
            .or_insert_with(|| EntitlementRecord::free(address, now))
            .clone())
    }

    async fn manual_upgrade(
        &self,
        address: &str,
        tier: Tier,
        expires_at: u64,
        now: u64,
    ) -> Result<EntitlementRecord, StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        let row = rows
            .entry(address.to_string())
            .or_insert_with(|| EntitlementRecord::free(address, now));
        row.tier = tier;
        row.expires_at = expires_at;
        Ok(row.clone())
    }

    async fn get(&self, address: &str) -> Result<Option<EntitlementRecord>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(rows.get(address).cloned())
    }

    async fn linked_records(&self) -> Result<Vec<EntitlementRecord>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(rows.values().cloned().collect())
    }

    async fn apply_batch(&self, updates: Vec<RowUpdate>) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Poisoned)?;
        let n = updates.len();
        for u in updates {
            let row = rows
                .entry(u.address.clone())
                .or_insert_with(|| EntitlementRecord::free(&u.address, u.synced_at));
            row.tier = u.tier;
            row.expires_at = u.expires_at;
            row.last_synced_at = Some(u.synced_at);
        }
        Ok(n)
    }
}

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS entitlements (
    address        TEXT PRIMARY KEY,
    tier           INTEGER NOT NULL DEFAULT 0,
    expires_at     INTEGER NOT NULL DEFAULT 0,
    linked_at      INTEGER NOT NULL,
    last_synced_at INTEGER
);
"#;

const SELECT_ROW: &str =
    "SELECT address, tier, expires_at, linked_at, last_synced_at FROM entitlements";

fn to_sql_int(v: u64) -> rusqlite::Result<i64> {
    i64::try_from(v).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_sql_int(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntitlementRecord> {
    let tier: i64 = row.get(1)?;
    let last_synced_at: Option<i64> = row.get(4)?;
    Ok(EntitlementRecord {
        address: row.get(0)?,
        tier: Tier::from_code(i128::from(tier)),
        expires_at: from_sql_int(row.get(2)?),
        linked_at: from_sql_int(row.get(3)?),
        last_synced_at: last_synced_at.map(from_sql_int),
    })
}

fn select_one(conn: &Connection, address: &str) -> rusqlite::Result<Option<EntitlementRecord>> {
    conn.query_row(
        &format!("{SELECT_ROW} WHERE address = ?1"),
        params![address],
        row_to_record,
    )
    .optional()
}

/// SQLite-backed store. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *conn).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[async_trait]
impl EntitlementStore for SqliteStore {
    async fn link_wallet(&self, address: &str, now: u64) -> Result<EntitlementRecord, StoreError> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO entitlements (address, tier, expires_at, linked_at)
                 VALUES (?1, 0, 0, ?2)",
                params![address, to_sql_int(now)?],
            )?;
            select_one(conn, &address)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
        })
        .await
    }

    async fn manual_upgrade(
        &self,
        address: &str,
        tier: Tier,
        expires_at: u64,
        now: u64,
    ) -> Result<EntitlementRecord, StoreError> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO entitlements (address, tier, expires_at, linked_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(address) DO UPDATE SET
                    tier = excluded.tier,
                    expires_at = excluded.expires_at",
                params![
                    address,
                    i64::from(tier.code()),
                    to_sql_int(expires_at)?,
                    to_sql_int(now)?
                ],
            )?;
            select_one(conn, &address)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
        })
        .await
    }

    async fn get(&self, address: &str) -> Result<Option<EntitlementRecord>, StoreError> {
        let address = address.to_string();
        self.with_conn(move |conn| select_one(conn, &address)).await
    }

    async fn linked_records(&self) -> Result<Vec<EntitlementRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_ROW} ORDER BY address"))?;
            let records = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn apply_batch(&self, updates: Vec<RowUpdate>) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO entitlements (address, tier, expires_at, linked_at, last_synced_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(address) DO UPDATE SET
                        tier = excluded.tier,
                        expires_at = excluded.expires_at,
                        last_synced_at = excluded.last_synced_at",
                )?;
                for u in &updates {
                    stmt.execute(params![
                        u.address,
                        i64::from(u.tier.code()),
                        to_sql_int(u.expires_at)?,
                        to_sql_int(u.synced_at)?
                    ])?;
                }
            }
            tx.commit()?;
            Ok(updates.len())
        })
        .await
    }
}
