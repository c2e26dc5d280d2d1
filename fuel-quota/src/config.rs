//! Service configuration.
//!
//! Loaded from a TOML file; every section falls back to defaults, so an
//! absent file gives a working single-node setup with the built-in plans.

use chrono::FixedOffset;
use fuel_plans::{PlanDefinitions, PlanId, PlanRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::QuotaEngine;
use crate::error::ConfigError;
use crate::keys::StationId;
use crate::retry::RetryConfig;
use crate::stations::StaticStationDirectory;
use crate::store::{open_store, DatabaseSettings};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fuel-quota/config.toml";

const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Plan assignment for stations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSettings {
    /// Plan for stations without an explicit assignment
    pub default_plan: String,
    /// Station id to plan id
    pub assignments: BTreeMap<String, String>,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            default_plan: "free".to_string(),
            assignments: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Address the HTTP API binds to
    pub listen: SocketAddr,
    pub log_level: String,
    /// Offset from UTC, in minutes, at which calendar months are cut
    pub utc_offset_minutes: i32,
    pub database: DatabaseSettings,
    pub retry: RetryConfig,
    pub stations: StationSettings,
    /// Inline plan definitions; mutually exclusive with `plans_file`
    pub plans: Option<PlanDefinitions>,
    pub plans_file: Option<PathBuf>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3010)),
            log_level: "info".to_string(),
            utc_offset_minutes: 0,
            database: DatabaseSettings::default(),
            retry: RetryConfig::default(),
            stations: StationSettings::default(),
            plans: None,
            plans_file: None,
        }
    }
}

impl QuotaConfig {
    /// Read the config at `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!("No config found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        log::info!("Reading config from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: QuotaConfig = toml::from_str(contents)?;
        config.utc_offset()?;
        if config.database.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "database.busy_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        if self.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "utc_offset_minutes must be within +/-{MAX_UTC_OFFSET_MINUTES}, got {}",
                self.utc_offset_minutes
            )));
        }
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            ConfigError::Invalid(format!("invalid utc_offset_minutes {}", self.utc_offset_minutes))
        })
    }

    /// Build the plan registry from inline plans, a plan file, or the
    /// built-in tiers, in that order.
    pub fn plan_registry(&self) -> Result<PlanRegistry, ConfigError> {
        match (&self.plans, &self.plans_file) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "set either `plans` or `plans_file`, not both".to_string(),
            )),
            (Some(definitions), None) => Ok(PlanRegistry::from_definitions(definitions.clone())?),
            (None, Some(path)) => Ok(PlanRegistry::from_file(path)?),
            (None, None) => Ok(PlanRegistry::builtin()),
        }
    }

    /// Station assignments, checked against `registry` so that a typo in a
    /// plan id fails at startup instead of on the first request.
    pub fn station_directory(&self, registry: &PlanRegistry) -> Result<StaticStationDirectory, ConfigError> {
        let parse_plan = |raw: &str| {
            raw.parse::<PlanId>()
                .map_err(|e| ConfigError::Invalid(format!("station plan {raw:?}: {e}")))
        };

        let default_plan = parse_plan(&self.stations.default_plan)?;
        let mut assignments = BTreeMap::new();
        for (station, plan) in &self.stations.assignments {
            let station = station
                .parse::<StationId>()
                .map_err(|e| ConfigError::Invalid(format!("station assignment {station:?}: {e}")))?;
            assignments.insert(station, parse_plan(plan)?);
        }

        let directory = StaticStationDirectory::new(default_plan, assignments);
        directory.validate(registry).map_err(|e| {
            log::error!("Station assignments reference an unregistered plan: {e}");
            ConfigError::Invalid(e.to_string())
        })?;
        Ok(directory)
    }

    /// Open the configured store and assemble the engine around it.
    pub fn build_engine(&self, registry: Arc<PlanRegistry>) -> Result<QuotaEngine, ConfigError> {
        let store = open_store(&self.database)?;
        Ok(QuotaEngine::new(registry, store)
            .with_utc_offset(self.utc_offset()?)
            .with_retry(self.retry.clone()))
    }
}
