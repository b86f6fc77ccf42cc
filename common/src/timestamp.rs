//! Snapshot timestamps
//!
//! Snapshot names end with a UTC timestamp in the fixed-width `YYYY-MM-DD-HHMMSS` form, so
//! lexicographic order of names is also chronological order. A [`Timestamp`] is captured
//! once per invocation and handed to the transaction and the retention sweeper, which never
//! read the clock themselves.

use anyhow::Context;
use chrono::Timelike;

pub const FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// Regex fragment matching a formatted timestamp.
pub const PATTERN: &str = r"[0-9]{4}-[0-9]{2}-[0-9]{2}-[0-9]{6}";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(chrono::NaiveDateTime);

impl Timestamp {
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(chrono::Utc::now().naive_utc())
    }

    /// Truncates to whole seconds, which is the resolution of the snapshot name.
    #[must_use]
    pub fn from_datetime(datetime: chrono::NaiveDateTime) -> Self {
        Self(datetime.with_nanosecond(0).unwrap_or(datetime))
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let datetime = chrono::NaiveDateTime::parse_from_str(value, FORMAT)
            .with_context(|| format!("timestamp {value:?} does not match format {FORMAT}"))?;
        Ok(Self(datetime))
    }

    #[must_use]
    pub fn datetime(&self) -> chrono::NaiveDateTime {
        self.0
    }

    /// Midnight of the day this timestamp falls on.
    #[must_use]
    pub fn midnight(&self) -> chrono::NaiveDateTime {
        self.0.date().and_time(chrono::NaiveTime::MIN)
    }

    #[must_use]
    pub fn days_before(&self, days: u32) -> chrono::NaiveDateTime {
        self.0 - chrono::Duration::days(i64::from(days))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.format(FORMAT))
    }
}

impl std::str::FromStr for Timestamp {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        Self::parse(value)
    }
}
