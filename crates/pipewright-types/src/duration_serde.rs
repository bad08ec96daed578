//! Serde helpers for human-readable durations (`"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"30d"`).
//!
//! Use with `#[serde(with = "pipewright_types::duration_serde")]`.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let ms = duration.as_millis();
    serializer.serialize_str(&format!("{}ms", ms))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration_str(&s).map_err(serde::de::Error::custom)
}

pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |val: &str| -> Result<u64, String> {
        val.trim()
            .parse()
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    };
    if let Some(val) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(val)?))
    } else if let Some(val) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(val)?))
    } else if let Some(val) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(val)? * 60))
    } else if let Some(val) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(val)? * 3600))
    } else if let Some(val) = s.strip_suffix('d') {
        Ok(Duration::from_secs(parse(val)? * 86400))
    } else {
        Err(format!("unknown duration format: {}", s))
    }
}
