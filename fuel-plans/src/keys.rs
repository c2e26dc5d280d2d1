use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LookupError;

const MAX_PLAN_ID_LEN: usize = 32;
const MAX_RESOURCE_KEY_LEN: usize = 64;

/// Identifier of a subscription plan, e.g. `free` or `premium`.
///
/// Plan ids are lowercase ASCII, start with a letter and may contain
/// digits, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlanId(String);

impl PlanId {
    pub(crate) fn from_static(id: &'static str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PlanId {
    type Err = LookupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let starts_ok = chars.next().map_or(false, |c| c.is_ascii_lowercase());
        let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !starts_ok || !rest_ok || s.len() > MAX_PLAN_ID_LEN {
            return Err(LookupError::InvalidKey(format!("malformed plan id {s:?}")));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for PlanId {
    type Error = LookupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PlanId> for String {
    fn from(value: PlanId) -> Self {
        value.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a metered capability, e.g. `ocr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey(String);

impl ResourceKey {
    pub(crate) fn from_static(key: &'static str) -> Self {
        Self(key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ResourceKey {
    type Err = LookupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let starts_ok = chars.next().map_or(false, |c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let rest_ok = chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' || c == '.'
        });
        if !starts_ok || !rest_ok || s.len() > MAX_RESOURCE_KEY_LEN {
            return Err(LookupError::InvalidKey(format!("malformed resource key {s:?}")));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = LookupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(value: ResourceKey) -> Self {
        value.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
