//! Time-bucket arithmetic shared by the bar store and its callers.
//!
//! A bucket start is always re-derivable from `(timestamp, resolution)` alone,
//! so every component computes boundaries identically.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Bar bucket width: a whole number of minutes, or one UTC calendar day.
///
/// Round-trips the feed server's resolution strings: `"1"`, `"5"`, `"15"`,
/// `"60"`, ... and `"D"` for daily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Minutes(u32),
    Daily,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Minutes(minutes) => write!(f, "{minutes}"),
            Resolution::Daily => write!(f, "D"),
        }
    }
}

impl FromStr for Resolution {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("d") {
            return Ok(Resolution::Daily);
        }
        match trimmed.parse::<u32>() {
            Ok(minutes) if minutes > 0 => Ok(Resolution::Minutes(minutes)),
            _ => Err(EngineError::InvalidResolution(s.to_string())),
        }
    }
}

/// Maps an absolute timestamp to the start of its bucket.
///
/// Minute resolutions floor to a multiple of the bucket width since the unix
/// epoch; daily floors to 00:00:00 UTC of the containing calendar day. Pure
/// and total: any caller re-derives the same boundary from the same inputs.
pub fn bucket_start(ts: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    match resolution {
        Resolution::Minutes(minutes) => {
            // Zero-width guard; `Resolution::from_str` never produces 0.
            let width = 60 * i64::from(minutes.max(1));
            let secs = ts.timestamp().div_euclid(width) * width;
            DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(ts)
        }
        Resolution::Daily => Utc.from_utc_datetime(&ts.date_naive().and_time(NaiveTime::MIN)),
    }
}
