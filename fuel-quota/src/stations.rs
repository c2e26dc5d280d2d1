use fuel_plans::{PlanId, PlanRegistry};
use std::collections::BTreeMap;

use crate::error::QuotaError;
use crate::keys::StationId;

/// Read-only view of which plan each station is on. Assignment itself is
/// owned by billing/admin tooling elsewhere.
pub trait StationDirectory: Send + Sync + std::fmt::Debug {
    fn plan_for(&self, station: StationId) -> Result<PlanId, QuotaError>;
}

/// Assignments fixed at startup from configuration, with a fallback plan
/// for stations that are not listed.
#[derive(Debug, Clone)]
pub struct StaticStationDirectory {
    default_plan: PlanId,
    assignments: BTreeMap<StationId, PlanId>,
}

impl StaticStationDirectory {
    pub fn new(default_plan: PlanId, assignments: BTreeMap<StationId, PlanId>) -> Self {
        Self { default_plan, assignments }
    }

    /// Fails with the first plan id that `registry` does not know.
    pub fn validate(&self, registry: &PlanRegistry) -> Result<(), QuotaError> {
        std::iter::once(&self.default_plan)
            .chain(self.assignments.values())
            .find(|plan| !registry.contains(plan))
            .map_or(Ok(()), |plan| Err(QuotaError::UnknownPlan(plan.clone())))
    }
}

impl StationDirectory for StaticStationDirectory {
    fn plan_for(&self, station: StationId) -> Result<PlanId, QuotaError> {
        Ok(self
            .assignments
            .get(&station)
            .unwrap_or(&self.default_plan)
            .clone())
    }
}
