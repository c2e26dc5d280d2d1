use serde::{Deserialize, Serialize};
use std::fmt;

const UNBOUNDED: &str = "unbounded";

/// Monthly allowance for a single resource.
///
/// Serialized as a plain integer for a finite cap and as the string
/// `"unbounded"` when the plan places no cap on the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawLimit", into = "RawLimit")]
pub enum LimitValue {
    /// At most `n` units per month. `Bounded(0)` disables the resource.
    Bounded(u64),
    Unbounded,
}

impl LimitValue {
    /// Whether `used` units are still inside the allowance.
    ///
    /// A station that has consumed nothing is always inside its allowance,
    /// so `Bounded(0)` permits only `used == 0`.
    pub fn permits(&self, used: u64) -> bool {
        match self {
            LimitValue::Unbounded => true,
            LimitValue::Bounded(max) => used == 0 || used < *max,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, LimitValue::Unbounded)
    }

    /// Units left before the cap is reached, `None` when unbounded.
    pub fn remaining(&self, used: u64) -> Option<u64> {
        match self {
            LimitValue::Unbounded => None,
            LimitValue::Bounded(max) => Some(max.saturating_sub(used)),
        }
    }
}

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitValue::Bounded(max) => write!(f, "{max}"),
            LimitValue::Unbounded => f.write_str(UNBOUNDED),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawLimit {
    Count(u64),
    Word(String),
}

impl TryFrom<RawLimit> for LimitValue {
    type Error = String;

    fn try_from(raw: RawLimit) -> Result<Self, Self::Error> {
        match raw {
            RawLimit::Count(max) => Ok(LimitValue::Bounded(max)),
            RawLimit::Word(word) if word.eq_ignore_ascii_case(UNBOUNDED) => Ok(LimitValue::Unbounded),
            RawLimit::Word(word) => Err(format!(
                "limit must be a non-negative integer or \"{UNBOUNDED}\", got {word:?}"
            )),
        }
    }
}

impl From<LimitValue> for RawLimit {
    fn from(value: LimitValue) -> Self {
        match value {
            LimitValue::Bounded(max) => RawLimit::Count(max),
            LimitValue::Unbounded => RawLimit::Word(UNBOUNDED.to_string()),
        }
    }
}
