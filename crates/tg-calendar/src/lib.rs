#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use tg_types::Scalar;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalendarError {
    #[error("unsupported frequency specifier: {0:?}")]
    UnsupportedFrequency(String),
    #[error("cannot interpret {value:?} as a timestamp")]
    InvalidTimestamp { value: String },
    #[error("date range start {start} is after end {end}")]
    RangeOutOfOrder {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    #[error("calendar arithmetic overflowed near {0}")]
    Overflow(NaiveDateTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl FrequencyUnit {
    fn fixed_seconds(self) -> Option<i64> {
        match self {
            Self::Second => Some(1),
            Self::Minute => Some(60),
            Self::Hour => Some(3_600),
            Self::Day => Some(86_400),
            Self::Week => Some(604_800),
            Self::Month | Self::Quarter | Self::Year => None,
        }
    }

    fn months(self) -> Option<u32> {
        match self {
            Self::Month => Some(1),
            Self::Quarter => Some(3),
            Self::Year => Some(12),
            _ => None,
        }
    }
}

/// Which instant of a bucket labels it in output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    #[default]
    Start,
    /// Last calendar day of the bucket, at midnight. Month, quarter and year only.
    End,
}

/// Weeks start on Monday; 1970-01-05 is the first Monday after the epoch.
const WEEK_ORIGIN_SECS: i64 = 4 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frequency {
    pub unit: FrequencyUnit,
    pub multiple: u32,
    pub anchor: Anchor,
}

impl Frequency {
    #[must_use]
    pub fn new(unit: FrequencyUnit) -> Self {
        Self {
            unit,
            multiple: 1,
            anchor: Anchor::Start,
        }
    }

    #[must_use]
    pub fn daily() -> Self {
        Self::new(FrequencyUnit::Day)
    }

    #[must_use]
    pub fn monthly() -> Self {
        Self::new(FrequencyUnit::Month)
    }

    #[must_use]
    pub fn yearly() -> Self {
        Self::new(FrequencyUnit::Year)
    }

    /// Parse a specifier such as `"D"`, `"3H"`, `"M"`, `"QE"` or `"YEARLY"`.
    pub fn parse(input: &str) -> Result<Self, CalendarError> {
        let unsupported = || CalendarError::UnsupportedFrequency(input.to_owned());
        let trimmed = input.trim();
        let digits_end = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, code) = trimmed.split_at(digits_end);

        let multiple = if digits.is_empty() {
            1
        } else {
            digits.parse::<u32>().map_err(|_| unsupported())?
        };
        if multiple == 0 {
            return Err(unsupported());
        }

        let (unit, anchor) = match code.to_ascii_uppercase().as_str() {
            "S" | "SEC" | "SECOND" | "SECONDS" => (FrequencyUnit::Second, Anchor::Start),
            "T" | "MIN" | "MINUTE" | "MINUTES" => (FrequencyUnit::Minute, Anchor::Start),
            "H" | "HOUR" | "HOURS" => (FrequencyUnit::Hour, Anchor::Start),
            "D" | "DAY" | "DAYS" | "DAILY" => (FrequencyUnit::Day, Anchor::Start),
            "W" | "WEEK" | "WEEKS" | "WEEKLY" => (FrequencyUnit::Week, Anchor::Start),
            "M" | "MS" | "MONTH" | "MONTHS" | "MONTHLY" => (FrequencyUnit::Month, Anchor::Start),
            "ME" => (FrequencyUnit::Month, Anchor::End),
            "Q" | "QS" | "QUARTER" | "QUARTERS" | "QUARTERLY" => {
                (FrequencyUnit::Quarter, Anchor::Start)
            }
            "QE" => (FrequencyUnit::Quarter, Anchor::End),
            "Y" | "YS" | "A" | "AS" | "YEAR" | "YEARS" | "YEARLY" | "ANNUAL" | "ANNUALLY" => {
                (FrequencyUnit::Year, Anchor::Start)
            }
            "YE" | "AE" => (FrequencyUnit::Year, Anchor::End),
            _ => return Err(unsupported()),
        };

        Ok(Self {
            unit,
            multiple,
            anchor,
        })
    }

    /// Floor `ts` to the start of its bucket.
    pub fn truncate(&self, ts: NaiveDateTime) -> Result<NaiveDateTime, CalendarError> {
        if let Some(unit_secs) = self.unit.fixed_seconds() {
            let width = unit_secs * i64::from(self.multiple);
            let origin = if self.unit == FrequencyUnit::Week {
                WEEK_ORIGIN_SECS
            } else {
                0
            };
            let secs = ts.and_utc().timestamp() - origin;
            let floored = secs.div_euclid(width) * width + origin;
            return DateTime::from_timestamp(floored, 0)
                .map(|dt| dt.naive_utc())
                .ok_or(CalendarError::Overflow(ts));
        }

        let width = i64::from(self.unit.months().unwrap_or(1)) * i64::from(self.multiple);
        let ordinal = i64::from(ts.year()) * 12 + i64::from(ts.month0());
        let floored = ordinal.div_euclid(width) * width;
        let year = i32::try_from(floored.div_euclid(12)).map_err(|_| CalendarError::Overflow(ts))?;
        let month = u32::try_from(floored.rem_euclid(12) + 1).map_err(|_| CalendarError::Overflow(ts))?;
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(|date| date.and_time(NaiveTime::MIN))
            .ok_or(CalendarError::Overflow(ts))
    }

    /// The next bucket start after `start`, or `None` past the calendar's range.
    #[must_use]
    pub fn step(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        match (self.unit.fixed_seconds(), self.unit.months()) {
            (Some(unit_secs), _) => {
                let delta = TimeDelta::try_seconds(unit_secs * i64::from(self.multiple))?;
                start.checked_add_signed(delta)
            }
            (None, Some(months)) => {
                start.checked_add_months(Months::new(months.checked_mul(self.multiple)?))
            }
            (None, None) => None,
        }
    }

    /// Output label for the bucket starting at `start`.
    pub fn label(&self, start: NaiveDateTime) -> Result<NaiveDateTime, CalendarError> {
        match self.anchor {
            Anchor::Start => Ok(start),
            Anchor::End => self
                .step(start)
                .and_then(|next| next.checked_sub_signed(TimeDelta::days(1)))
                .ok_or(CalendarError::Overflow(start)),
        }
    }

    /// Number of buckets from `start` to `end` inclusive, without stepping.
    ///
    /// Both ends must be bucket starts as [`Frequency::truncate`] returns them.
    pub fn bucket_count(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<usize, CalendarError> {
        if start > end {
            return Err(CalendarError::RangeOutOfOrder { start, end });
        }
        let multiple = i64::from(self.multiple);
        let steps = match (self.unit.fixed_seconds(), self.unit.months()) {
            (Some(secs), _) => end.signed_duration_since(start).num_seconds() / (secs * multiple),
            (None, Some(months)) => {
                let ordinal =
                    |ts: NaiveDateTime| i64::from(ts.year()) * 12 + i64::from(ts.month0());
                (ordinal(end) - ordinal(start)) / (i64::from(months) * multiple)
            }
            (None, None) => return Err(CalendarError::Overflow(end)),
        };
        steps
            .checked_add(1)
            .and_then(|count| usize::try_from(count).ok())
            .ok_or(CalendarError::Overflow(end))
    }
}

impl Default for Frequency {
    fn default() -> Self {
        Self::daily()
    }
}

impl FromStr for Frequency {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.multiple != 1 {
            write!(f, "{}", self.multiple)?;
        }
        let code = match (self.unit, self.anchor) {
            (FrequencyUnit::Second, _) => "S",
            (FrequencyUnit::Minute, _) => "T",
            (FrequencyUnit::Hour, _) => "H",
            (FrequencyUnit::Day, _) => "D",
            (FrequencyUnit::Week, _) => "W",
            (FrequencyUnit::Month, Anchor::Start) => "M",
            (FrequencyUnit::Month, Anchor::End) => "ME",
            (FrequencyUnit::Quarter, Anchor::Start) => "Q",
            (FrequencyUnit::Quarter, Anchor::End) => "QE",
            (FrequencyUnit::Year, Anchor::Start) => "Y",
            (FrequencyUnit::Year, Anchor::End) => "YE",
        };
        write!(f, "{code}")
    }
}

/// Lazy sequence of bucket starts from `start` through `end` inclusive.
#[derive(Debug, Clone)]
pub struct DateRange {
    next: Option<NaiveDateTime>,
    end: NaiveDateTime,
    freq: Frequency,
}

impl DateRange {
    pub fn new(
        start: NaiveDateTime,
        end: NaiveDateTime,
        freq: Frequency,
    ) -> Result<Self, CalendarError> {
        if start > end {
            return Err(CalendarError::RangeOutOfOrder { start, end });
        }
        Ok(Self {
            next: Some(start),
            end,
            freq,
        })
    }
}

impl Iterator for DateRange {
    type Item = NaiveDateTime;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.filter(|ts| *ts <= self.end)?;
        self.next = self.freq.step(current);
        Some(current)
    }
}

/// Every step from `start` through `end` inclusive.
pub fn date_range(
    start: NaiveDateTime,
    end: NaiveDateTime,
    freq: &Frequency,
) -> Result<Vec<NaiveDateTime>, CalendarError> {
    DateRange::new(start, end, *freq).map(Iterator::collect)
}

const DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Coerce a scalar to a timestamp.
///
/// Text accepts ISO-like dates and datetimes (RFC 3339 offsets are
/// normalized to UTC); integers are nanoseconds since the Unix epoch.
/// Missing values and empty text yield `Ok(None)`.
pub fn parse_timestamp(value: &Scalar) -> Result<Option<NaiveDateTime>, CalendarError> {
    let invalid = || CalendarError::InvalidTimestamp {
        value: value.to_string(),
    };

    match value {
        Scalar::Timestamp(ts) => Ok(Some(*ts)),
        v if v.is_missing() => Ok(None),
        Scalar::Int64(nanos) => {
            let secs = nanos.div_euclid(NANOS_PER_SEC);
            let subsec = u32::try_from(nanos.rem_euclid(NANOS_PER_SEC)).map_err(|_| invalid())?;
            DateTime::from_timestamp(secs, subsec)
                .map(|dt| Some(dt.naive_utc()))
                .ok_or_else(invalid)
        }
        Scalar::Utf8(text) => parse_timestamp_str(text).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn parse_timestamp_str(text: &str) -> Result<Option<NaiveDateTime>, CalendarError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nat") {
        return Ok(None);
    }

    if let Ok(zoned) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Some(zoned.naive_utc()));
    }
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Some(ts));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(Some(date.and_time(NaiveTime::MIN)));
        }
    }

    Err(CalendarError::InvalidTimestamp {
        value: trimmed.to_owned(),
    })
}
