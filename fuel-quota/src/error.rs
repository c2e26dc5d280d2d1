use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fuel_plans::{LookupError, PlanError, PlanId};
use serde_json::json;
use thiserror::Error;

/// Failures surfaced by the quota engine to its callers.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// The referenced plan has no registry entry. Always a configuration
    /// defect, never a transient condition.
    #[error("Unknown plan: {0}")]
    UnknownPlan(PlanId),

    /// The counter store could not complete the operation. Callers may retry
    /// with backoff; this is never the same thing as zero usage.
    #[error("Usage storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A station id, resource key or month is malformed.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl From<LookupError> for QuotaError {
    fn from(error: LookupError) -> Self {
        match error {
            LookupError::UnknownPlan(plan) => QuotaError::UnknownPlan(plan),
            LookupError::InvalidKey(msg) => QuotaError::InvalidKey(msg),
        }
    }
}

impl From<StoreError> for QuotaError {
    fn from(error: StoreError) -> Self {
        QuotaError::StorageUnavailable(error.to_string())
    }
}

impl IntoResponse for QuotaError {
    fn into_response(self) -> Response {
        let (status, json_body) = match &self {
            Self::InvalidKey(msg) => (StatusCode::BAD_REQUEST, json!({
                "error": "invalid_key",
                "message": msg
            })),
            Self::UnknownPlan(plan) => (StatusCode::INTERNAL_SERVER_ERROR, json!({
                "error": "unknown_plan",
                "message": "Station is assigned a plan with no registry entry",
                "details": {
                    "plan": plan.as_str()
                }
            })),
            Self::StorageUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, json!({
                "error": "storage_unavailable",
                "message": "Usage storage is unavailable, try again",
                "details": {
                    "reason": msg
                }
            })),
        };

        (status, Json(json_body)).into_response()
    }
}

/// Errors reported by a [`crate::store::UsageStore`] backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient contention on the store (locked database, busy writer).
    /// Nothing was written. The only retryable kind.
    #[error("store busy: {0}")]
    Busy(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded.
    #[error("corrupt usage record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &error {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Busy(error.to_string()),
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StoreError::Corrupt(error.to_string()),
                _ => StoreError::Unavailable(error.to_string()),
            },
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..) => StoreError::Corrupt(error.to_string()),
            _ => StoreError::Unavailable(error.to_string()),
        }
    }
}

/// Errors raised while loading or validating service configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid plan configuration: {0}")]
    Plan(#[from] PlanError),

    #[error("Failed to open usage store: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
