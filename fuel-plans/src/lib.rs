//! Plan registry for fuel station subscriptions.
//!
//! Maps each plan identifier to the monthly limits it places on metered
//! resources. The registry is loaded once at process start and is read-only
//! afterwards; plan changes are an administrative concern outside this crate.

pub mod error;
pub mod keys;
pub mod limit;
pub mod registry;

pub use error::{LookupError, PlanError};
pub use keys::{PlanId, ResourceKey};
pub use limit::LimitValue;
pub use registry::{Plan, PlanDefinitions, PlanRegistry, FREE_OCR_MONTHLY, OCR};
