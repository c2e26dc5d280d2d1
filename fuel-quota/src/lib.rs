pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod retry;
pub mod stations;
pub mod store;

// Re-export key types
pub use engine::{GatePolicy, LimitCheck, QuotaEngine};
pub use error::{ConfigError, QuotaError, StoreError};
pub use keys::{MonthBucket, StationId};
pub use stations::{StaticStationDirectory, StationDirectory};
pub use store::{MemoryStore, SqliteStore, UsageStore};
