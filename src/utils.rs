use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Device ids some endpoints report for the main heating device instead of `"0"`.
const HEATING_DEVICE_ALIASES: [&str; 3] = ["heating", "boiler", "heatpump"];

/// Canonical string form of a numeric identifier (`12345.0` -> `"12345"`).
///
/// Returns `None` for non-finite or fractional values, which are never valid ids.
pub fn canonical_number_id(value: f64) -> Option<String> {
    if !value.is_finite() || value.fract() != 0.0 || value.abs() >= 9.0e15 {
        return None;
    }
    Some(format!("{}", value as i64))
}

/// Normalizes a device id so every subsystem joins on the same key.
///
/// The main heating device is addressed as `"0"`; a few endpoints use a sentinel
/// name (or nothing at all) for it instead.
pub fn normalize_device_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || HEATING_DEVICE_ALIASES
            .iter()
            .any(|alias| trimmed.eq_ignore_ascii_case(alias))
    {
        return "0".to_string();
    }
    trimmed.to_string()
}

/// Renders a scalar JSON value the way it is stored and hashed: strings unquoted, everything else as JSON.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Timestamp rendering used for hashing and logs (UTC, millisecond precision).
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_are_canonicalized() {
        assert_eq!(canonical_number_id(12345.0).as_deref(), Some("12345"));
        assert_eq!(canonical_number_id(0.0).as_deref(), Some("0"));
        assert_eq!(canonical_number_id(12.5), None);
        assert_eq!(canonical_number_id(f64::NAN), None);
    }

    #[test]
    fn heating_aliases_map_to_zero() {
        assert_eq!(normalize_device_id("heating"), "0");
        assert_eq!(normalize_device_id("HeatPump"), "0");
        assert_eq!(normalize_device_id(""), "0");
        assert_eq!(normalize_device_id("0"), "0");
        assert_eq!(normalize_device_id("zigbee-048d1234"), "zigbee-048d1234");
        assert_eq!(normalize_device_id("RoomControl-1"), "RoomControl-1");
    }

    #[test]
    fn scalar_text_unquotes_strings() {
        assert_eq!(scalar_text(&json!("on")), "on");
        assert_eq!(scalar_text(&json!(21.5)), "21.5");
        assert_eq!(scalar_text(&json!(true)), "true");
    }
}
