use chrono::{DateTime, Datelike, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::QuotaError;

/// Largest station id; ids are stored as signed 64-bit integers.
pub const MAX_STATION_ID: u64 = i64::MAX as u64;

/// Positive integer identifying a fuel station, at most [`MAX_STATION_ID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct StationId(u64);

impl StationId {
    pub fn new(id: u64) -> Result<Self, QuotaError> {
        if id == 0 {
            return Err(QuotaError::InvalidKey("station id must be positive".to_string()));
        }
        if id > MAX_STATION_ID {
            return Err(QuotaError::InvalidKey(format!(
                "station id {id} exceeds {MAX_STATION_ID}"
            )));
        }
        Ok(Self(id))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for StationId {
    type Error = QuotaError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StationId> for u64 {
    fn from(value: StationId) -> Self {
        value.0
    }
}

impl FromStr for StationId {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .parse::<u64>()
            .map_err(|_| QuotaError::InvalidKey(format!("malformed station id {s:?}")))?;
        Self::new(id)
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Calendar year-month a usage counter belongs to, written `YYYY-MM`.
///
/// Ordering is chronological, and the textual form sorts the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthBucket {
    year: i32,
    month: u32,
}

impl MonthBucket {
    pub fn new(year: i32, month: u32) -> Result<Self, QuotaError> {
        if !(1..=9999).contains(&year) || !(1..=12).contains(&month) {
            return Err(QuotaError::InvalidKey(format!(
                "month bucket out of range: {year}-{month}"
            )));
        }
        Ok(Self { year, month })
    }

    /// The bucket containing `at`, evaluated in `at`'s own time zone.
    pub fn containing<Tz: TimeZone>(at: &DateTime<Tz>) -> Result<Self, QuotaError> {
        Self::new(at.year(), at.month())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// The month before, `None` before `0001-01`.
    pub fn previous(&self) -> Option<Self> {
        match self.month {
            1 => Self::new(self.year - 1, 12).ok(),
            m => Self::new(self.year, m - 1).ok(),
        }
    }

    /// The month after, `None` past `9999-12`.
    pub fn next(&self) -> Option<Self> {
        match self.month {
            12 => Self::new(self.year + 1, 1).ok(),
            m => Self::new(self.year, m + 1).ok(),
        }
    }
}

impl FromStr for MonthBucket {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || QuotaError::InvalidKey(format!("malformed month {s:?}, expected YYYY-MM"));

        let (year, month) = s.split_once('-').ok_or_else(malformed)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(malformed());
        }
        if !year.bytes().chain(month.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }

        let year = year.parse::<i32>().map_err(|_| malformed())?;
        let month = month.parse::<u32>().map_err(|_| malformed())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for MonthBucket {
    type Error = QuotaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonthBucket> for String {
    fn from(value: MonthBucket) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MonthBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}
