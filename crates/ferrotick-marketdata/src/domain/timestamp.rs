use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::ValidationError;

/// Instant on the UTC timeline, written as RFC3339 with a `Z` suffix.
///
/// Bar open times, chunk bounds and request ranges all use this type, so
/// comparisons never have to reconcile offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcDateTime(OffsetDateTime);

impl UtcDateTime {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    /// Parses RFC3339 text; any offset other than UTC is rejected.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        OffsetDateTime::parse(input.trim(), &Rfc3339)
            .ok()
            .filter(|value| value.offset() == UtcOffset::UTC)
            .map(Self)
            .ok_or_else(|| ValidationError::TimestampNotUtc {
                value: input.to_owned(),
            })
    }

    pub fn from_unix_seconds(seconds: i64) -> Result<Self, ValidationError> {
        OffsetDateTime::from_unix_timestamp(seconds)
            .map(Self)
            .map_err(|_| ValidationError::TimestampOutOfRange { seconds })
    }

    pub fn unix_seconds(self) -> i64 {
        self.0.unix_timestamp()
    }

    pub fn format_rfc3339(self) -> String {
        self.0
            .format(&Rfc3339)
            .unwrap_or_else(|_| format!("@{}", self.unix_seconds()))
    }

    /// Builds a timestamp from unix seconds, clamping to the representable range.
    pub(crate) fn from_unix_clamped(seconds: i64) -> Self {
        match OffsetDateTime::from_unix_timestamp(seconds) {
            Ok(value) => Self(value),
            Err(_) if seconds < 0 => Self(PrimitiveDateTime::MIN.assume_utc()),
            Err(_) => Self(PrimitiveDateTime::MAX.assume_utc()),
        }
    }

    pub(crate) fn floor_to_day(self) -> Self {
        Self(self.0.replace_time(Time::MIDNIGHT))
    }

    /// Months elapsed since year 0, used for calendar-aligned arithmetic.
    pub(crate) fn month_index(self) -> i64 {
        let date = self.0.date();
        i64::from(date.year()) * 12 + i64::from(u8::from(date.month())) - 1
    }

    /// First instant of the month identified by [`UtcDateTime::month_index`].
    pub(crate) fn from_month_index(index: i64) -> Self {
        let year = index.div_euclid(12);
        let month = index.rem_euclid(12) + 1;

        let date = i32::try_from(year).ok().and_then(|year| {
            let month = Month::try_from(month as u8).ok()?;
            Date::from_calendar_date(year, month, 1).ok()
        });

        match date {
            Some(date) => Self(date.midnight().assume_utc()),
            None if index < 0 => Self(PrimitiveDateTime::MIN.assume_utc()),
            None => Self(PrimitiveDateTime::MAX.assume_utc()),
        }
    }
}

impl Display for UtcDateTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format_rfc3339())
    }
}

impl Serialize for UtcDateTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.format_rfc3339())
    }
}

impl<'de> Deserialize<'de> for UtcDateTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_text_round_trips_through_unix_seconds() {
        let parsed = UtcDateTime::parse("2024-01-01T00:00:00Z").expect("must parse");
        assert_eq!(parsed.unix_seconds(), 1_704_067_200);
        assert_eq!(parsed.to_string(), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn offsets_other_than_utc_are_rejected() {
        for input in ["2024-01-01T01:00:00+01:00", "2024-01-01", "yesterday"] {
            assert!(matches!(
                UtcDateTime::parse(input),
                Err(ValidationError::TimestampNotUtc { .. })
            ));
        }
    }

    #[test]
    fn day_floor_drops_time_of_day() {
        let ts = UtcDateTime::parse("2024-03-09T17:45:12Z").expect("must parse");
        assert_eq!(ts.floor_to_day().to_string(), "2024-03-09T00:00:00Z");
    }

    #[test]
    fn month_index_round_trips_across_year_boundary() {
        let ts = UtcDateTime::parse("2023-12-17T08:30:00Z").expect("must parse");
        let next = UtcDateTime::from_month_index(ts.month_index() + 1);
        assert_eq!(next.format_rfc3339(), "2024-01-01T00:00:00Z");
    }
}
