//! Timestamp normalization.
//!
//! The storage addresses records by microseconds since the UNIX epoch. Callers
//! may hand timestamps over in a closed set of shapes ([`TimeInput`]); every
//! shape is converted with [`to_micros`], which either returns the exact
//! microsecond value or fails with [`Error::InvalidTimestamp`]. Nothing is
//! rounded away silently, except float seconds which are rounded to the
//! nearest microsecond because `f64` cannot hold most decimal fractions.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{Error, Result};

pub const TIME_PRECISION: u64 = 1_000_000;

/// 9999-12-31T23:59:59.999999Z, the last instant an ISO 8601 string can carry.
pub const MAX_TIMESTAMP: u64 = 253_402_300_799_999_999;

#[derive(Debug, Clone, PartialEq)]
pub enum TimeInput {
    Micros(u64),
    SignedMicros(i64),
    /// Seconds since the epoch as a float.
    Seconds(f64),
    /// ISO 8601 / RFC 3339 string with an explicit offset (`Z` or `+hh:mm`).
    Iso(String),
    DateTime(DateTime<Utc>),
    SystemTime(SystemTime),
}

impl From<u64> for TimeInput {
    fn from(value: u64) -> Self {
        Self::Micros(value)
    }
}

impl From<i64> for TimeInput {
    fn from(value: i64) -> Self {
        Self::SignedMicros(value)
    }
}

impl From<f64> for TimeInput {
    fn from(value: f64) -> Self {
        Self::Seconds(value)
    }
}

impl From<&str> for TimeInput {
    fn from(value: &str) -> Self {
        Self::Iso(value.to_string())
    }
}

impl From<String> for TimeInput {
    fn from(value: String) -> Self {
        Self::Iso(value)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for TimeInput {
    fn from(value: DateTime<Tz>) -> Self {
        Self::DateTime(value.with_timezone(&Utc))
    }
}

impl From<SystemTime> for TimeInput {
    fn from(value: SystemTime) -> Self {
        Self::SystemTime(value)
    }
}

/// Normalize any supported timestamp shape to microseconds since the epoch.
pub fn to_micros(input: impl Into<TimeInput>) -> Result<u64> {
    match input.into() {
        TimeInput::Micros(micros) => check_range(micros),
        TimeInput::SignedMicros(micros) => {
            let micros = u64::try_from(micros).map_err(|_| {
                Error::InvalidTimestamp(format!("{micros} is before the UNIX epoch"))
            })?;
            check_range(micros)
        }
        TimeInput::Seconds(seconds) => {
            if !seconds.is_finite() {
                return Err(Error::InvalidTimestamp(format!(
                    "{seconds} is not a finite number of seconds"
                )));
            }
            if seconds < 0.0 {
                return Err(Error::InvalidTimestamp(format!(
                    "{seconds} is before the UNIX epoch"
                )));
            }
            let micros = (seconds * TIME_PRECISION as f64).round();
            if micros > MAX_TIMESTAMP as f64 {
                return Err(Error::InvalidTimestamp(format!("{seconds} is out of range")));
            }
            Ok(micros as u64)
        }
        TimeInput::Iso(text) => {
            let parsed = DateTime::parse_from_rfc3339(text.trim()).map_err(|e| {
                Error::InvalidTimestamp(format!(
                    "'{text}' is not an ISO 8601 timestamp with an offset: {e}"
                ))
            })?;
            datetime_to_micros(&parsed.with_timezone(&Utc))
        }
        TimeInput::DateTime(datetime) => datetime_to_micros(&datetime),
        TimeInput::SystemTime(time) => {
            let since_epoch = time.duration_since(UNIX_EPOCH).map_err(|_| {
                Error::InvalidTimestamp(format!("{time:?} is before the UNIX epoch"))
            })?;
            if since_epoch.subsec_nanos() % 1_000 != 0 {
                return Err(Error::InvalidTimestamp(format!(
                    "{time:?} has sub-microsecond precision"
                )));
            }
            let micros = u64::try_from(since_epoch.as_micros())
                .map_err(|_| Error::InvalidTimestamp(format!("{time:?} is out of range")))?;
            check_range(micros)
        }
    }
}

fn datetime_to_micros(datetime: &DateTime<Utc>) -> Result<u64> {
    if datetime.timestamp_subsec_nanos() % 1_000 != 0 {
        return Err(Error::InvalidTimestamp(format!(
            "{} has sub-microsecond precision",
            datetime.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )));
    }
    let micros = u64::try_from(datetime.timestamp_micros()).map_err(|_| {
        Error::InvalidTimestamp(format!("{datetime} is before the UNIX epoch"))
    })?;
    check_range(micros)
}

fn check_range(micros: u64) -> Result<u64> {
    if micros > MAX_TIMESTAMP {
        return Err(Error::InvalidTimestamp(format!(
            "{micros} is later than year 9999"
        )));
    }
    Ok(micros)
}

pub fn to_datetime(micros: u64) -> Result<DateTime<Utc>> {
    let micros = i64::try_from(check_range(micros)?)
        .map_err(|_| Error::InvalidTimestamp(format!("{micros} is out of range")))?;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::InvalidTimestamp(format!("{micros} is out of range")))
}

/// Render microseconds as an RFC 3339 string in UTC with microsecond precision.
pub fn to_iso(micros: u64) -> Result<String> {
    Ok(to_datetime(micros)?.to_rfc3339_opts(SecondsFormat::Micros, true))
}
