use thiserror::Error;

use crate::keys::PlanId;

/// Failures of a registry lookup or of parsing a plan id or resource key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The referenced plan has no registry entry
    #[error("Unknown plan: {0}")]
    UnknownPlan(PlanId),

    /// A plan id or resource key is malformed
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Error types for loading plan definitions
#[derive(Error, Debug)]
pub enum PlanError {
    /// A plan definition could not be turned into a registry entry
    #[error("Invalid plan definition: {0}")]
    InvalidDefinition(String),

    #[error("Failed to read plan file: {0}")]
    Io(#[from] std::io::Error),
}
