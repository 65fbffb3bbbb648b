//! Bar durations expressed as a unit and a multiplier.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::{UtcDateTime, ValidationError};

const SECONDS_PER_DAY: i64 = 86_400;
// 1970-01-05 was the first Monday after the unix epoch.
const FIRST_MONDAY_OFFSET: i64 = 4 * SECONDS_PER_DAY;

/// Calendar unit of a [`TimeFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeUnit {
    pub const ALL: [Self; 6] = [
        Self::Second,
        Self::Minute,
        Self::Hour,
        Self::Day,
        Self::Week,
        Self::Month,
    ];

    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Second => "s",
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
            Self::Week => "w",
            Self::Month => "mn",
        }
    }

    /// Length of one unit in seconds. Months count as 30 days.
    pub const fn nominal_seconds(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => SECONDS_PER_DAY,
            Self::Week => 7 * SECONDS_PER_DAY,
            Self::Month => 30 * SECONDS_PER_DAY,
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "s" => Some(Self::Second),
            "m" => Some(Self::Minute),
            "h" => Some(Self::Hour),
            "d" => Some(Self::Day),
            "w" => Some(Self::Week),
            "mn" => Some(Self::Month),
            _ => None,
        }
    }
}

/// Coarse grouping of timeframes used by the chunk-size policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFrameBucket {
    /// Bars shorter than one day.
    Intraday,
    /// Daily bars and longer.
    EndOfDay,
}

/// Bar duration, e.g. `m5` (five minutes) or `h1` (one hour).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeFrame {
    unit: TimeUnit,
    multiplier: u32,
}

impl TimeFrame {
    pub const M1: Self = Self::from_parts(TimeUnit::Minute, 1);
    pub const M5: Self = Self::from_parts(TimeUnit::Minute, 5);
    pub const M15: Self = Self::from_parts(TimeUnit::Minute, 15);
    pub const H1: Self = Self::from_parts(TimeUnit::Hour, 1);
    pub const H4: Self = Self::from_parts(TimeUnit::Hour, 4);
    pub const D1: Self = Self::from_parts(TimeUnit::Day, 1);
    pub const W1: Self = Self::from_parts(TimeUnit::Week, 1);
    pub const MN1: Self = Self::from_parts(TimeUnit::Month, 1);

    const fn from_parts(unit: TimeUnit, multiplier: u32) -> Self {
        Self { unit, multiplier }
    }

    pub fn new(unit: TimeUnit, multiplier: u32) -> Result<Self, ValidationError> {
        if multiplier == 0 {
            return Err(ValidationError::InvalidTimeFrame {
                value: format!("{}{multiplier}", unit.prefix()),
            });
        }
        Ok(Self { unit, multiplier })
    }

    pub const fn unit(self) -> TimeUnit {
        self.unit
    }

    pub const fn multiplier(self) -> u32 {
        self.multiplier
    }

    /// Nominal bar length; months are approximated as 30 days.
    pub fn nominal_duration(self) -> Duration {
        Duration::seconds(self.nominal_seconds())
    }

    pub const fn bucket(self) -> TimeFrameBucket {
        if self.nominal_seconds() < SECONDS_PER_DAY {
            TimeFrameBucket::Intraday
        } else {
            TimeFrameBucket::EndOfDay
        }
    }

    /// Open time of the bar containing `ts`.
    pub fn floor(self, ts: UtcDateTime) -> UtcDateTime {
        match self.unit {
            TimeUnit::Month => {
                let step = i64::from(self.multiplier);
                let index = ts.month_index();
                UtcDateTime::from_month_index(index - index.rem_euclid(step))
            }
            TimeUnit::Week => {
                let step = self.nominal_seconds();
                let shifted = ts.unix_seconds() - FIRST_MONDAY_OFFSET;
                UtcDateTime::from_unix_clamped(
                    shifted - shifted.rem_euclid(step) + FIRST_MONDAY_OFFSET,
                )
            }
            _ => {
                let step = self.nominal_seconds();
                let seconds = ts.unix_seconds();
                UtcDateTime::from_unix_clamped(seconds - seconds.rem_euclid(step))
            }
        }
    }

    /// Open time of the bar following the one containing `ts`.
    pub fn next_open(self, ts: UtcDateTime) -> UtcDateTime {
        self.shift(self.floor(ts), 1)
    }

    /// Open time `bars` bars before the bar containing `ts`.
    pub fn step_back(self, ts: UtcDateTime, bars: u32) -> UtcDateTime {
        self.shift(self.floor(ts), -i64::from(bars))
    }

    fn shift(self, aligned: UtcDateTime, bars: i64) -> UtcDateTime {
        match self.unit {
            TimeUnit::Month => UtcDateTime::from_month_index(
                aligned.month_index() + bars * i64::from(self.multiplier),
            ),
            _ => UtcDateTime::from_unix_clamped(
                aligned
                    .unix_seconds()
                    .saturating_add(bars.saturating_mul(self.nominal_seconds())),
            ),
        }
    }

    const fn nominal_seconds(self) -> i64 {
        self.unit.nominal_seconds() * self.multiplier as i64
    }
}

impl PartialOrd for TimeFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nominal_seconds()
            .cmp(&other.nominal_seconds())
            .then_with(|| self.unit.cmp(&other.unit))
            .then_with(|| self.multiplier.cmp(&other.multiplier))
    }
}

impl Display for TimeFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.unit.prefix(), self.multiplier)
    }
}

impl FromStr for TimeFrame {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidTimeFrame {
            value: value.to_owned(),
        };

        let trimmed = value.trim();
        let digits_at = trimmed
            .find(|ch: char| ch.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (prefix, digits) = trimmed.split_at(digits_at);

        let unit = TimeUnit::from_prefix(prefix).ok_or_else(invalid)?;
        if !digits.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(invalid());
        }
        let multiplier = digits.parse::<u32>().map_err(|_| invalid())?;
        if multiplier == 0 {
            return Err(invalid());
        }

        Ok(Self { unit, multiplier })
    }
}

impl TryFrom<String> for TimeFrame {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeFrame> for String {
    fn from(value: TimeFrame) -> Self {
        value.to_string()
    }
}
