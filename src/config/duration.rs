//! Duration parsing utilities.

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parse a duration string like "1h", "30m", "300s", "250ms", "300000".
/// Supports:
/// - Plain numbers (interpreted as milliseconds): "300000"
/// - Milliseconds suffix: "250ms"
/// - Seconds suffix: "300s"
/// - Minutes suffix: "30m"
/// - Hours suffix: "1h"
/// - Days suffix: "1d"
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    // "ms" must be checked before "m" and "s"
    if let Some(num_str) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse_amount(num_str, "milliseconds")?));
    }
    if let Some(num_str) = s.strip_suffix('d') {
        return Ok(Duration::from_secs(parse_amount(num_str, "days")? * 86_400));
    }
    if let Some(num_str) = s.strip_suffix('h') {
        return Ok(Duration::from_secs(parse_amount(num_str, "hours")? * 3600));
    }
    if let Some(num_str) = s.strip_suffix('m') {
        return Ok(Duration::from_secs(parse_amount(num_str, "minutes")? * 60));
    }
    if let Some(num_str) = s.strip_suffix('s') {
        return Ok(Duration::from_secs(parse_amount(num_str, "seconds")?));
    }

    // No suffix - treat as milliseconds
    s.parse::<u64>()
        .map(Duration::from_millis)
        .with_context(|| format!("Invalid duration value: {s}"))
}

fn parse_amount(num_str: &str, unit: &str) -> anyhow::Result<u64> {
    num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid {unit} value: {num_str}"))
}

/// Deserialize a duration written either as a string accepted by
/// [`parse_duration`] or as an integer number of milliseconds.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_duration_bare_number_is_millis() {
        assert_eq!(parse_duration("300000").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration(" 0 ").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("1.5h").is_err());
    }
}
