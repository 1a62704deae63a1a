use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Seconds between 1900-01-01 and the unix epoch.
pub const EPOCH_1900_OFFSET_SECS: i64 = 2_208_988_800;

pub fn unix_time_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Formats as `YYYY-MM-DDTHH:MM:SS.ffffffZ`, the form the export endpoint expects.
pub fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Parses an ISO-8601 timestamp.
///
/// Accepts RFC 3339 (`2018-01-01T00:00:00Z`, with or without fractional seconds
/// or offset), naive date-times with `T` or a space separator, and bare dates.
/// Values without an offset are taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let t = s.trim();
    if t.is_empty() {
        return Err(Error::TimeParse(s.to_string()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = t.trim_end_matches('Z');
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
    }

    if let Ok(d) = NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        if let Some(ndt) = d.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
    }

    Err(Error::TimeParse(s.to_string()))
}

/// Converts seconds since 1900-01-01 (the OOI time base) to a UTC timestamp.
pub fn seconds_to_date(secs: f64) -> Option<DateTime<Utc>> {
    offset_to_date(secs, 1.0, -EPOCH_1900_OFFSET_SECS)
}

/// Converts `value * unit_secs` seconds past `epoch_unix_secs` to a timestamp,
/// rounded to the microsecond.
pub(crate) fn offset_to_date(value: f64, unit_secs: f64, epoch_unix_secs: i64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let total = value * unit_secs;
    let whole = total.floor();
    let mut secs = whole as i64 + epoch_unix_secs;
    let mut micros = ((total - whole) * 1e6).round() as i64;
    if micros >= 1_000_000 {
        secs += 1;
        micros -= 1_000_000;
    }
    DateTime::from_timestamp(secs, (micros * 1000) as u32)
}
