use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Duration;

/// Nanoseconds since the unix epoch.
#[repr(transparent)]
#[derive(Debug, Hash, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis.saturating_mul(1_000_000))
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Result<Self> {
        let nanos = dt
            .timestamp_nanos_opt()
            .ok_or_else(|| anyhow!("Invalid timestamp"))?;

        if nanos < 0 {
            return Err(anyhow!("Timestamp cannot represent dates before 1970"));
        }

        Ok(Timestamp(nanos as u64))
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    pub fn now() -> Self {
        // Current time is always after 1970, so this unwrap is safe
        Self::from_datetime(Utc::now()).expect("Current time should always be valid")
    }

    pub fn plus(&self, duration: Duration) -> Self {
        Timestamp(
            self.0
                .saturating_add(duration.secs.saturating_mul(1_000_000_000)),
        )
    }

    pub fn minus(&self, duration: Duration) -> Self {
        Timestamp(
            self.0
                .saturating_sub(duration.secs.saturating_mul(1_000_000_000)),
        )
    }

    /// Time elapsed from `earlier` to `self`; zero when `earlier` is in the future.
    pub fn since(&self, earlier: Timestamp) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dt = DateTime::<Utc>::from_timestamp_nanos(self.0 as i64);
        write!(f, "{}", dt.to_rfc3339())
    }
}
