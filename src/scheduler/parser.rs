use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use thiserror::Error;

use crate::config::Config;
use crate::scheduler::event::ManualRequest;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("invalid start time '{0}': {1}")]
    Start(String, String),
    #[error("invalid duration '{0}': {1}")]
    Duration(String, String),
    #[error("duration must be positive")]
    NonPositiveDuration,
    #[error("duration exceeds {} hours", MAX_RECORDING.num_hours())]
    DurationTooLong,
    #[error("unknown satellite '{0}'")]
    UnknownSatellite(String),
}

/// Longest manual recording accepted.
pub const MAX_RECORDING: Duration = Duration::hours(24);

/// Build a manual request from operator input.
///
/// `start` accepts `T+10m` (relative to `now`), RFC 3339, or
/// `YYYY-MM-DD HH:MM:SS` in UTC. `duration` accepts a bare number of minutes
/// or a humantime string such as `12m30s`.
pub fn parse_manual_request(
    satellite: &str,
    start: &str,
    duration: &str,
    now: DateTime<Utc>,
) -> Result<ManualRequest, ParseError> {
    let start = parse_start(start, now)?;
    let duration = parse_recording_duration(duration)?;
    if duration <= Duration::zero() {
        return Err(ParseError::NonPositiveDuration);
    }
    if duration > MAX_RECORDING {
        return Err(ParseError::DurationTooLong);
    }
    let request = ManualRequest::new(satellite.trim(), start, duration);
    if request.end().is_none() {
        return Err(ParseError::Start(start.to_rfc3339(), "out of range".into()));
    }
    Ok(request)
}

/// Manual requests may only name satellites from the catalog.
pub fn check_known(request: &ManualRequest, config: &Config) -> Result<(), ParseError> {
    match config.satellite(&request.satellite) {
        Some(_) => Ok(()),
        None => Err(ParseError::UnknownSatellite(request.satellite.clone())),
    }
}

pub fn parse_start(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ParseError> {
    let s = s.trim();
    let err = |msg: String| ParseError::Start(s.to_string(), msg);

    // Relative: T+10s, T-5m
    if s.to_lowercase().starts_with('t') && !s.contains(':') {
        let rest = &s[1..];
        let (neg, rest) = match rest.strip_prefix('-') {
            Some(r) => (true, r),
            None => (false, rest.strip_prefix('+').unwrap_or(rest)),
        };
        let dur = parse_duration(rest).map_err(err)?;
        let start = if neg {
            now.checked_sub_signed(dur)
        } else {
            now.checked_add_signed(dur)
        };
        return start.ok_or_else(|| err("out of range".into()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| err(e.to_string()))
}

pub fn parse_recording_duration(s: &str) -> Result<Duration, ParseError> {
    let s = s.trim();
    if let Ok(minutes) = s.parse::<f64>() {
        if !minutes.is_finite() {
            return Err(ParseError::Duration(s.to_string(), "not finite".into()));
        }
        let millis = (minutes * 60_000.0).round();
        if millis.abs() > MAX_RECORDING.num_milliseconds() as f64 {
            return Err(ParseError::DurationTooLong);
        }
        return Ok(Duration::milliseconds(millis as i64));
    }
    parse_duration(s).map_err(|e| ParseError::Duration(s.to_string(), e))
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s.trim())
        .map_err(|e| e.to_string())
        .and_then(|d| Duration::from_std(d).map_err(|e| e.to_string()))
}
