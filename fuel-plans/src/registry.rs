use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{LookupError, PlanError};
use crate::keys::{PlanId, ResourceKey};
use crate::limit::LimitValue;

/// Resource key used for OCR scans of pump receipts and delivery notes.
pub const OCR: &str = "ocr";

/// Monthly OCR allowance of the built-in `free` plan.
pub const FREE_OCR_MONTHLY: u64 = 100;

/// Raw plan definitions as they appear in configuration:
/// `plan id -> resource key -> limit`.
pub type PlanDefinitions = BTreeMap<PlanId, BTreeMap<ResourceKey, LimitValue>>;

/// A named tier assigning a limit (or no limit) to each resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub id: PlanId,
    pub limits: BTreeMap<ResourceKey, LimitValue>,
}

impl Plan {
    /// Limit for `resource`. Resources the plan does not list are unbounded.
    pub fn limit_for(&self, resource: &ResourceKey) -> LimitValue {
        self.limits
            .get(resource)
            .copied()
            .unwrap_or(LimitValue::Unbounded)
    }
}

/// Process-wide plan configuration, read-only once constructed.
#[derive(Debug, Clone)]
pub struct PlanRegistry {
    plans: BTreeMap<PlanId, Plan>,
}

impl PlanRegistry {
    /// The default tiers: `free` with a capped OCR allowance and `premium`
    /// with unlimited OCR.
    pub fn builtin() -> Self {
        let ocr = ResourceKey::from_static(OCR);
        let free = Plan {
            id: PlanId::from_static("free"),
            limits: BTreeMap::from([(ocr.clone(), LimitValue::Bounded(FREE_OCR_MONTHLY))]),
        };
        let premium = Plan {
            id: PlanId::from_static("premium"),
            limits: BTreeMap::from([(ocr, LimitValue::Unbounded)]),
        };

        Self {
            plans: [free, premium]
                .into_iter()
                .map(|plan| (plan.id.clone(), plan))
                .collect(),
        }
    }

    pub fn from_definitions(definitions: PlanDefinitions) -> Result<Self, PlanError> {
        if definitions.is_empty() {
            return Err(PlanError::InvalidDefinition(
                "plan registry must define at least one plan".to_string(),
            ));
        }

        let plans = definitions
            .into_iter()
            .map(|(id, limits)| (id.clone(), Plan { id, limits }))
            .collect::<BTreeMap<_, _>>();

        log::debug!(
            "Loaded {} plans: {}",
            plans.len(),
            plans.keys().map(PlanId::as_str).collect::<Vec<_>>().join(", ")
        );

        Ok(Self { plans })
    }

    /// Parse a standalone plan file where every top-level table is a plan:
    ///
    /// ```toml
    /// [free]
    /// ocr = 100
    ///
    /// [premium]
    /// ocr = "unbounded"
    /// ```
    pub fn from_toml_str(contents: &str) -> Result<Self, PlanError> {
        let definitions: PlanDefinitions =
            toml::from_str(contents).map_err(|e| PlanError::InvalidDefinition(e.to_string()))?;
        Self::from_definitions(definitions)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        log::info!("Reading plan definitions from {}", path.as_ref().display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Resolve the monthly limit `plan_id` assigns to `resource`.
    ///
    /// Fails with [`LookupError::UnknownPlan`] when the plan is not registered.
    /// A resource the plan does not list resolves to
    /// [`LimitValue::Unbounded`], so newly metered resources stay open until
    /// a plan explicitly caps them.
    pub fn resolve_limit(&self, plan_id: &PlanId, resource: &ResourceKey) -> Result<LimitValue, LookupError> {
        self.plans
            .get(plan_id)
            .map(|plan| plan.limit_for(resource))
            .ok_or_else(|| LookupError::UnknownPlan(plan_id.clone()))
    }

    pub fn get(&self, plan_id: &PlanId) -> Option<&Plan> {
        self.plans.get(plan_id)
    }

    pub fn contains(&self, plan_id: &PlanId) -> bool {
        self.plans.contains_key(plan_id)
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }
}

impl Default for PlanRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
