//! Durable counter storage for usage records.
//!
//! A record is keyed by `(station, resource, month)` and holds a count that
//! only ever grows. Backends must make [`UsageStore::increment`] linearizable
//! per key: concurrent increments serialize, none is lost, and the returned
//! value is the count including this increment.

use async_trait::async_trait;
use fuel_plans::ResourceKey;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::StoreError;
use crate::keys::{MonthBucket, StationId};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Composite key of a usage record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    pub station: StationId,
    pub resource: ResourceKey,
    pub month: MonthBucket,
}

impl UsageKey {
    pub fn new(station: StationId, resource: ResourceKey, month: MonthBucket) -> Self {
        Self { station, resource, month }
    }
}

#[async_trait]
pub trait UsageStore: Send + Sync + std::fmt::Debug {
    /// Atomically insert the record with count 1, or add 1 to the existing
    /// count, returning the resulting value.
    ///
    /// An error means the count was not changed. Implementations bound their
    /// own waits and report them as [`StoreError::Busy`].
    async fn increment(&self, key: &UsageKey) -> Result<u64, StoreError>;

    /// Current count for `key`; 0 when the record was never created.
    async fn count(&self, key: &UsageKey) -> Result<u64, StoreError>;

    /// Every month with a record for this station and resource, oldest first.
    async fn history(&self, station: StationId, resource: &ResourceKey) -> Result<Vec<(MonthBucket, u64)>, StoreError>;

    /// Delete records strictly older than `month`, returning how many were
    /// removed.
    async fn prune_before(&self, month: MonthBucket) -> Result<u64, StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    Memory,
}

/// Counter store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Which backend keeps the counters
    pub backend: Backend,
    /// SQLite database file
    pub path: PathBuf,
    /// Deadline for one store attempt, covering the wait for the connection
    /// and for SQLite's write lock
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: PathBuf::from("/var/lib/fuel-quota/usage.db"),
            busy_timeout_ms: 500,
        }
    }
}

/// Open the configured backend.
pub fn open_store(settings: &DatabaseSettings) -> Result<Arc<dyn UsageStore>, StoreError> {
    match settings.backend {
        Backend::Sqlite => {
            let store = SqliteStore::open(
                &settings.path,
                std::time::Duration::from_millis(settings.busy_timeout_ms),
            )?;
            Ok(Arc::new(store))
        }
        Backend::Memory => {
            log::warn!("Using the in-memory usage store; counters are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
