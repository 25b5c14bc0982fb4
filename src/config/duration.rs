// src/config/duration.rs

//! Duration values in config files.
//!
//! Accepted forms:
//! - plain numbers (seconds): `30`, `2.5`
//! - suffixed strings: `"500ms"`, `"30s"`, `"5m"`, `"1h"`
//! - ISO 8601 durations: `"PT30S"`, `"PT1H30M"`, `"P1D"`

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(f64),
    Text(String),
}

impl RawDuration {
    fn into_secs(self) -> Result<f64, String> {
        match self {
            RawDuration::Secs(s) => checked(s),
            RawDuration::Text(t) => parse_duration(&t),
        }
    }
}

/// Durations must be finite and not negative.
fn checked(secs: f64) -> Result<f64, String> {
    if !secs.is_finite() {
        Err(format!("duration {secs} is not finite"))
    } else if secs < 0.0 {
        Err(format!("negative duration {secs}"))
    } else {
        Ok(secs)
    }
}

fn iso_duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^P(?:(\d+(?:\.\d+)?)D)?(?:T(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
        )
        .expect("built-in duration regex is valid")
    })
}

/// Parse a duration string into seconds.
pub fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    if s.starts_with('P') {
        let caps = iso_duration_regex()
            .captures(s)
            .ok_or_else(|| format!("invalid ISO 8601 duration '{s}'"))?;
        if s == "P" || s.ends_with('T') {
            return Err(format!("invalid ISO 8601 duration '{s}'"));
        }
        let part = |i: usize, scale: f64| -> f64 {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .map(|v| v * scale)
                .unwrap_or(0.0)
        };
        return checked(part(1, 86_400.0) + part(2, 3_600.0) + part(3, 60.0) + part(4, 1.0));
    }

    if let Ok(secs) = s.parse::<f64>() {
        return checked(secs);
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: f64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    let secs = match unit.as_str() {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 60.0 * 60.0,
        _ => {
            return Err(format!(
                "unsupported duration unit '{}'; expected ms, s, m, or h",
                unit
            ));
        }
    };
    checked(secs)
}

pub fn de_secs<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    RawDuration::deserialize(d)?
        .into_secs()
        .map_err(serde::de::Error::custom)
}

pub fn de_opt_secs<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Option::<RawDuration>::deserialize(d)?
        .map(RawDuration::into_secs)
        .transpose()
        .map_err(serde::de::Error::custom)
}

pub fn de_secs_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
    Vec::<RawDuration>::deserialize(d)?
        .into_iter()
        .map(RawDuration::into_secs)
        .collect::<Result<_, _>>()
        .map_err(serde::de::Error::custom)
}

pub fn de_opt_secs_list<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<Vec<f64>>, D::Error> {
    match Option::<Vec<RawDuration>>::deserialize(d)? {
        None => Ok(None),
        Some(list) => list
            .into_iter()
            .map(RawDuration::into_secs)
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
