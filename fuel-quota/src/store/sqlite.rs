use async_trait::async_trait;
use fuel_plans::ResourceKey;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::keys::{MonthBucket, StationId};
use crate::store::{UsageKey, UsageStore};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS usage_records (
      station_id       INTEGER NOT NULL CHECK (station_id > 0),
      resource         TEXT NOT NULL,
      month            TEXT NOT NULL,
      count            INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
      PRIMARY KEY (station_id, resource, month)
    )";

// Single statement: the upsert and the returned count come from the same
// write, so concurrent writers on the same file cannot interleave.
static INCREMENT_SQL: &str = "INSERT INTO usage_records (station_id, resource, month, count)
      VALUES (?1, ?2, ?3, 1)
      ON CONFLICT (station_id, resource, month) DO UPDATE SET count = count + 1
      RETURNING count";

/// SQLite-backed counter store. The database file may be shared by several
/// processes; SQLite's locking serializes their writes.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and ensures the
    /// schema exists.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("failed to create {}: {e}", parent.display())))?;
            }
        }

        log::info!("Opening usage database at {}", path.display());
        let conn = Connection::open(path)?;
        Self::init(conn, busy_timeout)
    }

    /// A private in-memory database, mostly useful in tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, Duration::from_millis(500))
    }

    fn init(conn: Connection, busy_timeout: Duration) -> Result<Self, StoreError> {
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        log::debug!("usage database journal mode: {mode}");
        conn.execute(CREATE_TABLE_SQL, [])?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            busy_timeout,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// One deadline, `busy_timeout` from the call, covers both the wait for
    /// the connection and SQLite's wait for its write lock. Running out of it
    /// is reported as `Busy` before `f` has written anything. The task is
    /// always awaited to completion, so the returned result is the real
    /// outcome of the statement.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let deadline = Instant::now() + self.busy_timeout;

        tokio::task::spawn_blocking(move || {
            let guard = conn
                .try_lock_until(deadline)
                .ok_or_else(|| StoreError::Busy("usage database connection in use".to_string()))?;
            guard.busy_timeout(deadline.saturating_duration_since(Instant::now()))?;
            f(&*guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

// `StationId` never exceeds `i64::MAX`.
fn station_param(station: StationId) -> Result<i64, StoreError> {
    i64::try_from(station.get()).map_err(|_| StoreError::Corrupt(format!("station id {station} out of range")))
}

fn count_from_sql(raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::Corrupt(format!("negative usage count {raw}")))
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn increment(&self, key: &UsageKey) -> Result<u64, StoreError> {
        let station = station_param(key.station)?;
        let resource = key.resource.to_string();
        let month = key.month.to_string();

        self.with_conn(move |conn| {
            let raw: i64 = conn.query_row(INCREMENT_SQL, params![station, resource, month], |row| row.get(0))?;
            count_from_sql(raw)
        })
        .await
    }

    async fn count(&self, key: &UsageKey) -> Result<u64, StoreError> {
        let station = station_param(key.station)?;
        let resource = key.resource.to_string();
        let month = key.month.to_string();

        self.with_conn(move |conn| {
            let raw: Option<i64> = conn
                .query_row(
                    "SELECT count FROM usage_records WHERE station_id = ?1 AND resource = ?2 AND month = ?3",
                    params![station, resource, month],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map_or(Ok(0), count_from_sql)
        })
        .await
    }

    async fn history(&self, station: StationId, resource: &ResourceKey) -> Result<Vec<(MonthBucket, u64)>, StoreError> {
        let station = station_param(station)?;
        let resource = resource.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT month, count FROM usage_records
                  WHERE station_id = ?1 AND resource = ?2
                  ORDER BY month ASC",
            )?;
            let rows = stmt.query_map(params![station, resource], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut history = Vec::new();
            for row in rows {
                let (month, count) = row?;
                let month = month
                    .parse::<MonthBucket>()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                history.push((month, count_from_sql(count)?));
            }
            Ok(history)
        })
        .await
    }

    async fn prune_before(&self, month: MonthBucket) -> Result<u64, StoreError> {
        let month = month.to_string();

        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM usage_records WHERE month < ?1", params![month])?;
            Ok(removed as u64)
        })
        .await
    }
}
