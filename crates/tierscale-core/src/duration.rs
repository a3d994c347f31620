//! Duration strings: `"500ms"`, `"30s"`, `"5m"`, `"1h"`, or a bare number
//! of seconds. Fractional values (`"0.5s"`) are accepted.

use std::time::Duration;

/// Parse a duration string. Returns `None` for empty, negative,
/// unparseable or out-of-range input.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (number, scale) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1.0)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60.0)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600.0)
    } else {
        (s, 1.0)
    };

    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(value * scale).ok()
}

/// Whether the string ends in a recognised duration suffix.
pub fn has_duration_suffix(s: &str) -> bool {
    let s = s.trim();
    ["ms", "s", "m", "h"].iter().any(|suffix| s.ends_with(suffix))
}

/// Serde adapter storing a `Duration` as a duration string.
pub mod serde_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let millis = d.as_millis();
        if millis % 1000 == 0 {
            s.serialize_str(&format!("{}s", millis / 1000))
        } else {
            s.serialize_str(&format!("{millis}ms"))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {raw:?}")))
    }
}
