/// Bar timeframes and UTC bucket arithmetic
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VerifyError;

/// Timeframe of a stored bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinute,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [
        Timeframe::OneMinute,
        Timeframe::FiveMinute,
        Timeframe::OneHour,
        Timeframe::OneDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinute => "5m",
            Timeframe::OneHour => "1h",
            Timeframe::OneDay => "1d",
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        match self {
            Timeframe::OneMinute => 1,
            Timeframe::FiveMinute => 5,
            Timeframe::OneHour => 60,
            Timeframe::OneDay => 1440, // 24 * 60
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes())
    }

    /// Child timeframe and the number of children in one full bucket.
    ///
    /// Every derived timeframe rolls up directly from 1-minute bars.
    pub fn child_spec(&self) -> Option<(Timeframe, u32)> {
        match self {
            Timeframe::OneMinute => None,
            Timeframe::FiveMinute => Some((Timeframe::OneMinute, 5)),
            Timeframe::OneHour => Some((Timeframe::OneMinute, 60)),
            Timeframe::OneDay => Some((Timeframe::OneMinute, 1440)),
        }
    }

    /// Start of the bucket containing `timestamp` (floor, UTC)
    pub fn get_bar_boundary(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.duration_minutes() * 60;
        let secs = timestamp.timestamp();
        let floored = secs - secs.rem_euclid(step);
        DateTime::from_timestamp(floored, 0).unwrap_or(timestamp)
    }

    /// Smallest boundary that is `>= timestamp`
    pub fn get_bar_ceiling(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let floor = self.get_bar_boundary(timestamp);
        if floor == timestamp {
            floor
        } else {
            floor + self.duration()
        }
    }

    /// Alignment rule used by the alignment check.
    ///
    /// 5m: minute % 5 == 0, 1h: minute == 0, 1d: hour == 0 and minute == 0.
    /// 1m bars only need a zero second.
    pub fn is_aligned(&self, timestamp: DateTime<Utc>) -> bool {
        match self {
            Timeframe::OneMinute => timestamp.second() == 0,
            Timeframe::FiveMinute => timestamp.minute() % 5 == 0,
            Timeframe::OneHour => timestamp.minute() == 0,
            Timeframe::OneDay => timestamp.hour() == 0 && timestamp.minute() == 0,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Timeframe::OneMinute),
            "5m" => Ok(Timeframe::FiveMinute),
            "1h" => Ok(Timeframe::OneHour),
            "1d" => Ok(Timeframe::OneDay),
            other => Err(VerifyError::InvalidParameter(format!(
                "Unsupported timeframe '{}'. Supported: 1m, 5m, 1h, 1d",
                other
            ))),
        }
    }
}
