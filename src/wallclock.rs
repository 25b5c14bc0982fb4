// src/wallclock.rs

//! Wall-clock helpers.
//!
//! Times are carried around as `f64` seconds since the Unix epoch so they can
//! be compared and offset cheaply inside the scheduling loop; formatting to
//! and from ISO 8601 goes through `chrono`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Current time in seconds since the epoch.
pub fn now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

/// Format epoch seconds as an extended ISO 8601 UTC string.
pub fn time_string(secs: f64) -> String {
    match Utc.timestamp_opt(secs.floor() as i64, 0).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => format!("{secs}"),
    }
}

pub fn current_time_string() -> String {
    time_string(now())
}

/// Parse a cycle point or time string into epoch seconds.
///
/// Accepts RFC 3339 plus the compact forms used for cycle points
/// (`20260101T0000Z`, `2026-01-01T00:00Z`, `2026-01-01`).
pub fn parse_time_string(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp() as f64);
    }
    let naive_formats = [
        "%Y%m%dT%H%MZ",
        "%Y%m%dT%H%M%SZ",
        "%Y-%m-%dT%H:%MZ",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y%m%dT%H",
    ];
    for fmt in naive_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp() as f64);
        }
    }
    for fmt in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp() as f64);
        }
    }
    None
}

/// Render a number of seconds as an ISO 8601 duration, e.g. `PT1M30S`.
pub fn interval_as_str(secs: f64) -> String {
    let total = secs.round().max(0.0) as u64;
    if total == 0 {
        return "PT0S".to_string();
    }
    let (days, rem) = (total / 86_400, total % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours + minutes + seconds > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if seconds > 0 {
            out.push_str(&format!("{seconds}S"));
        }
    }
    out
}
