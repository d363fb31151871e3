// Temporal support: the two FEEL duration kinds, time-of-day with an offset,
// and ISO-8601 parsing/formatting for the conversion built-ins.

use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Months, NaiveDateTime, NaiveTime, Timelike};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Temporal parsing errors
#[derive(Error, Debug)]
pub enum TemporalError {
    #[error("invalid date '{0}'")]
    InvalidDate(String),

    #[error("invalid time '{0}'")]
    InvalidTime(String),

    #[error("invalid date and time '{0}'")]
    InvalidDateTime(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
}

// ── ZonedTime ────────────────────────────────────────────────────────────────

/// A time of day with a fixed UTC offset.
///
/// chrono has no offset-carrying time-of-day type, so this pairs a
/// `NaiveTime` with a `FixedOffset`. Equality is structural (same local time
/// and same offset); ordering is by instant, with the local time breaking
/// ties, mirroring the usual platform semantics for offset times.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZonedTime {
    time: NaiveTime,
    offset: FixedOffset,
}

impl ZonedTime {
    pub fn new(time: NaiveTime, offset: FixedOffset) -> Self {
        ZonedTime { time, offset }
    }

    pub fn time(&self) -> NaiveTime {
        self.time
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Nanoseconds since local midnight shifted to UTC. May be negative or
    /// exceed one day; only used for comparison and subtraction.
    fn instant_nanos(&self) -> i64 {
        let local = self.time.num_seconds_from_midnight() as i64 * 1_000_000_000
            + self.time.nanosecond() as i64;
        local - self.offset.local_minus_utc() as i64 * 1_000_000_000
    }

    /// Add a (possibly negative) day-time duration, wrapping around midnight.
    pub fn wrapping_add(&self, duration: Duration) -> Self {
        ZonedTime {
            time: self.time.overflowing_add_signed(duration).0,
            offset: self.offset,
        }
    }

    /// The signed duration from `other` to `self`, comparing instants.
    pub fn signed_duration_since(&self, other: &ZonedTime) -> Duration {
        Duration::nanoseconds(self.instant_nanos() - other.instant_nanos())
    }
}

impl PartialOrd for ZonedTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ZonedTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.instant_nanos()
            .cmp(&other.instant_nanos())
            .then_with(|| self.time.cmp(&other.time))
    }
}

impl fmt::Display for ZonedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset.local_minus_utc() == 0 {
            write!(f, "{}Z", self.time)
        } else {
            write!(f, "{}{}", self.time, self.offset)
        }
    }
}

impl FromStr for ZonedTime {
    type Err = TemporalError;

    /// Parse `HH:MM:SS[.fff]` followed by `Z` or `±HH:MM`.
    fn from_str(s: &str) -> Result<Self, TemporalError> {
        let err = || TemporalError::InvalidTime(s.to_string());

        if let Some(local) = s.strip_suffix('Z') {
            let time = parse_local_time(local).map_err(|_| err())?;
            return Ok(ZonedTime::new(time, FixedOffset::east_opt(0).unwrap()));
        }

        // The offset sign is the only '+'/'-' in a time string.
        let idx = s.rfind(['+', '-']).ok_or_else(err)?;
        let time = parse_local_time(&s[..idx]).map_err(|_| err())?;
        let offset = parse_offset(&s[idx..]).ok_or_else(err)?;
        Ok(ZonedTime::new(time, offset))
    }
}

impl Serialize for ZonedTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ZonedTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ZonedTimeVisitor;

        impl Visitor<'_> for ZonedTimeVisitor {
            type Value = ZonedTime;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a time with offset, e.g. \"10:30:00+01:00\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ZonedTime, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(ZonedTimeVisitor)
    }
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

// ── YearMonthDuration ────────────────────────────────────────────────────────

/// A FEEL year-month duration, stored as a normalized month count.
///
/// Years and months are interchangeable at a fixed 12:1 ratio, so a single
/// signed month counter is the normal form; `years()`/`months()` split it
/// back apart for display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonthDuration {
    months: i64,
}

impl YearMonthDuration {
    pub fn from_months(months: i64) -> Self {
        YearMonthDuration { months }
    }

    pub fn of(years: i64, months: i64) -> Self {
        YearMonthDuration {
            months: years * 12 + months,
        }
    }

    pub fn total_months(&self) -> i64 {
        self.months
    }

    pub fn years(&self) -> i64 {
        self.months / 12
    }

    pub fn months(&self) -> i64 {
        self.months % 12
    }
}

impl Add for YearMonthDuration {
    type Output = YearMonthDuration;

    fn add(self, rhs: Self) -> Self {
        YearMonthDuration::from_months(self.months + rhs.months)
    }
}

impl Sub for YearMonthDuration {
    type Output = YearMonthDuration;

    fn sub(self, rhs: Self) -> Self {
        YearMonthDuration::from_months(self.months - rhs.months)
    }
}

impl Neg for YearMonthDuration {
    type Output = YearMonthDuration;

    fn neg(self) -> Self {
        YearMonthDuration::from_months(-self.months)
    }
}

impl fmt::Display for YearMonthDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.months == 0 {
            return write!(f, "P0M");
        }
        if self.months < 0 {
            write!(f, "-")?;
        }
        write!(f, "P")?;
        let (years, months) = (self.years().abs(), self.months().abs());
        if years != 0 {
            write!(f, "{}Y", years)?;
        }
        if months != 0 {
            write!(f, "{}M", months)?;
        }
        Ok(())
    }
}

// ── Duration parsing & formatting ────────────────────────────────────────────

/// Either FEEL duration kind, as produced by the `duration` built-in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParsedDuration {
    YearMonth(YearMonthDuration),
    DayTime(Duration),
}

/// Parse an ISO-8601 duration literal into one of the two FEEL kinds.
///
/// Year/month designators select a year-month duration; day/time designators
/// select a day-time duration. Mixing the two groups is rejected, as are
/// empty bodies like `P` or `PT`.
pub fn parse_duration(s: &str) -> Result<ParsedDuration, TemporalError> {
    let err = || TemporalError::InvalidDuration(s.to_string());

    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let body = rest.strip_prefix('P').ok_or_else(err)?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) if !t.is_empty() => (d, Some(t)),
        Some(_) => return Err(err()),
        None => (body, None),
    };

    let mut years = None;
    let mut months = None;
    let mut days = None;
    for (value, unit) in designators(date_part).ok_or_else(err)? {
        let target = match unit {
            'Y' => &mut years,
            'M' => &mut months,
            'D' => &mut days,
            _ => return Err(err()),
        };
        if target.replace(value).is_some() {
            return Err(err());
        }
    }

    let mut hours = None;
    let mut minutes = None;
    let mut seconds = None;
    if let Some(time_part) = time_part {
        for (value, unit) in designators(time_part).ok_or_else(err)? {
            let target = match unit {
                'H' => &mut hours,
                'M' => &mut minutes,
                'S' => &mut seconds,
                _ => return Err(err()),
            };
            if target.replace(value).is_some() {
                return Err(err());
            }
        }
    }

    let year_month = years.is_some() || months.is_some();
    let day_time = days.is_some() || hours.is_some() || minutes.is_some() || seconds.is_some();
    match (year_month, day_time) {
        (true, false) => {
            let total = years.unwrap_or(0.0) * 12.0 + months.unwrap_or(0.0);
            if total.fract() != 0.0 {
                return Err(err());
            }
            let total = if negative { -total } else { total };
            Ok(ParsedDuration::YearMonth(YearMonthDuration::from_months(
                total as i64,
            )))
        }
        (false, true) => {
            let secs = days.unwrap_or(0.0) * 86_400.0
                + hours.unwrap_or(0.0) * 3_600.0
                + minutes.unwrap_or(0.0) * 60.0
                + seconds.unwrap_or(0.0);
            let nanos = (secs * 1e9).round() as i64;
            let nanos = if negative { -nanos } else { nanos };
            Ok(ParsedDuration::DayTime(Duration::nanoseconds(nanos)))
        }
        _ => Err(err()),
    }
}

/// Split a designator run like `1Y2M` into (value, unit) pairs.
fn designators(s: &str) -> Option<Vec<(f64, char)>> {
    let mut result = Vec::new();
    let mut number = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            if number.is_empty() {
                return None;
            }
            result.push((number.parse().ok()?, c));
            number.clear();
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(result)
}

/// Format a day-time duration as an ISO-8601 literal (`P1DT2H3M4.5S`).
pub fn format_day_time(d: &Duration) -> String {
    let mut nanos = match d.num_nanoseconds() {
        Some(n) => n,
        None => d.num_milliseconds() * 1_000_000,
    };
    let mut out = String::new();
    if nanos < 0 {
        out.push('-');
        nanos = -nanos;
    }
    out.push('P');

    let days = nanos / 86_400_000_000_000;
    nanos %= 86_400_000_000_000;
    let hours = nanos / 3_600_000_000_000;
    nanos %= 3_600_000_000_000;
    let minutes = nanos / 60_000_000_000;
    nanos %= 60_000_000_000;
    let seconds = nanos / 1_000_000_000;
    let subsec = nanos % 1_000_000_000;

    if days != 0 {
        out.push_str(&format!("{}D", days));
    }
    if hours != 0 || minutes != 0 || seconds != 0 || subsec != 0 || days == 0 {
        out.push('T');
        if hours != 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes != 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if subsec != 0 {
            let frac = format!("{:09}", subsec);
            out.push_str(&format!("{}.{}S", seconds, frac.trim_end_matches('0')));
        } else if seconds != 0 || (hours == 0 && minutes == 0) {
            out.push_str(&format!("{}S", seconds));
        }
    }
    out
}

/// Serde adapter for `chrono::Duration` fields, using the ISO literal form.
pub mod day_time_serde {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_day_time(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        match parse_duration(&s) {
            Ok(ParsedDuration::DayTime(d)) => Ok(d),
            _ => Err(de::Error::custom(format!(
                "invalid day-time duration '{}'",
                s
            ))),
        }
    }
}

// ── Date / time / date-time parsing ──────────────────────────────────────────

pub fn parse_date(s: &str) -> Result<chrono::NaiveDate, TemporalError> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| TemporalError::InvalidDate(s.to_string()))
}

pub fn parse_local_time(s: &str) -> Result<NaiveTime, TemporalError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .map_err(|_| TemporalError::InvalidTime(s.to_string()))
}

pub fn parse_local_date_time(s: &str) -> Result<NaiveDateTime, TemporalError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|_| TemporalError::InvalidDateTime(s.to_string()))
}

pub fn parse_date_time(s: &str) -> Result<DateTime<FixedOffset>, TemporalError> {
    DateTime::parse_from_rfc3339(s).map_err(|_| TemporalError::InvalidDateTime(s.to_string()))
}

// ── Month arithmetic ─────────────────────────────────────────────────────────

/// Add a signed month count to a local date-time, with the platform's
/// day-of-month clamping (Jan 31 + 1 month = Feb 28/29).
pub fn shift_months_local(dt: NaiveDateTime, months: i64) -> NaiveDateTime {
    let amount = match u32::try_from(months.unsigned_abs()) {
        Ok(n) => Months::new(n),
        Err(_) => return dt,
    };
    let shifted = if months >= 0 {
        dt.checked_add_months(amount)
    } else {
        dt.checked_sub_months(amount)
    };
    shifted.unwrap_or(dt)
}

/// As [`shift_months_local`], for zoned date-times.
pub fn shift_months_zoned(dt: DateTime<FixedOffset>, months: i64) -> DateTime<FixedOffset> {
    let amount = match u32::try_from(months.unsigned_abs()) {
        Ok(n) => Months::new(n),
        Err(_) => return dt,
    };
    let shifted = if months >= 0 {
        dt.checked_add_months(amount)
    } else {
        dt.checked_sub_months(amount)
    };
    shifted.unwrap_or(dt)
}
