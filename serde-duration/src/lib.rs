//! Human readable durations for serde: `"250ms"`, `"3s"`, `"30m"`, `"12h"`, `"90d"` or `"never"`.
//!
//! Use with `#[serde(with = "serde_duration")]`.
use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse(&s).map_err(serde::de::Error::custom)
}

/// Render a duration in the largest unit that divides it exactly.
pub fn format(duration: &Duration) -> String {
    if duration == &Duration::MAX {
        return "never".into();
    }
    if duration.subsec_nanos() != 0 || duration.is_zero() {
        return format!("{}ms", duration.as_millis());
    }
    let secs = duration.as_secs();
    let (value, unit) = if secs % (24 * 3600) == 0 {
        (secs / (24 * 3600), "d")
    } else if secs % 3600 == 0 {
        (secs / 3600, "h")
    } else if secs % 60 == 0 {
        (secs / 60, "m")
    } else {
        (secs, "s")
    };
    format!("{value}{unit}")
}

/// Parse a duration string such as `"3000ms"` or `"30m"`.
pub fn parse(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Duration string cannot be empty".into());
    }
    if s == "never" {
        return Ok(Duration::MAX);
    }
    if let Some(value) = s.strip_suffix("ms") {
        let value = value.trim().parse::<u64>().map_err(|e| e.to_string())?;
        return Ok(Duration::from_millis(value));
    }
    let split = s.len() - 1;
    if !s.is_char_boundary(split) {
        return Err("Invalid time unit. Use ms, s, m, h, or d".into());
    }
    let (value, unit) = s.split_at(split);
    let value = value.trim().parse::<u64>().map_err(|e| e.to_string())?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 24 * 3600,
        _ => return Err("Invalid time unit. Use ms, s, m, h, or d".into()),
    };
    Ok(Duration::from_secs(seconds))
}
