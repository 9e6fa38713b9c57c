//! Conversion of upstream event history entries into archived rows.
//!
//! The API carries no stable event id, so rows are identified by a SHA-256 digest
//! over the fields that make an event distinct.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::db::models::{NewEvent, event_types};
use crate::models::vicare::EventDto;
use crate::utils::{format_ts, normalize_device_id, scalar_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub description: Option<&'static str>,
    pub category: &'static str,
    pub severity: &'static str,
}

// Codes with a known description; anything else is classified by its letter prefix.
const KNOWN_CODES: &[(&str, &str, &str, &str)] = &[
    ("F.160", "Communication error with outdoor unit", "fault", "error"),
    ("F.454", "Compressor high pressure", "fault", "critical"),
    ("F.472", "Refrigerant circuit low pressure", "fault", "critical"),
    ("F.518", "No communication with energy manager", "fault", "error"),
    ("F.542", "Mixing valve fault", "fault", "error"),
    ("F.788", "Outside temperature sensor fault", "fault", "error"),
    ("F.1100", "Flow temperature sensor fault", "fault", "error"),
    ("A.11", "Defrost active", "warning", "warning"),
    ("A.16", "Low flow rate", "warning", "warning"),
    ("P.1", "Service interval reached", "maintenance", "warning"),
    ("S.111", "Heating mode", "status", "info"),
    ("S.118", "Domestic hot water heating", "status", "info"),
    ("S.123", "Standby", "status", "info"),
    ("S.125", "Frost protection", "status", "info"),
    ("S.134", "Defrost", "status", "info"),
    ("I.56", "Electric heater active", "info", "info"),
];

/// Classifies an event locally from its type and error code.
pub fn classify(event_type: &str, error_code: Option<&str>) -> Classification {
    match event_type {
        event_types::GATEWAY_OFFLINE => {
            return Classification {
                description: Some("Gateway went offline"),
                category: "connectivity",
                severity: "warning",
            };
        }
        event_types::GATEWAY_ONLINE => {
            return Classification {
                description: Some("Gateway came online"),
                category: "connectivity",
                severity: "info",
            };
        }
        event_types::FEATURE_CHANGED => {
            return Classification {
                description: None,
                category: "info",
                severity: "info",
            };
        }
        _ => {}
    }

    let Some(code) = error_code.map(str::trim).filter(|c| !c.is_empty()) else {
        return Classification {
            description: None,
            category: "info",
            severity: "info",
        };
    };

    if let Some(&(_, description, category, severity)) = KNOWN_CODES.iter().find(|(c, ..)| c.eq_ignore_ascii_case(code)) {
        return Classification {
            description: Some(description),
            category,
            severity,
        };
    }

    let (category, severity) = match code.chars().next().map(|c| c.to_ascii_uppercase()) {
        Some('F') => ("fault", "error"),
        Some('A') => ("warning", "warning"),
        Some('S') => ("status", "info"),
        Some('P') => ("maintenance", "warning"),
        _ => ("info", "info"),
    };
    Classification {
        description: None,
        category,
        severity,
    }
}

/// Fields that define event identity, in hashing order.
#[derive(Debug, Clone, Copy)]
pub struct EventKey<'a> {
    pub timestamp: DateTime<Utc>,
    pub event_type: &'a str,
    pub device_id: Option<&'a str>,
    pub installation_id: &'a str,
    pub error_code: Option<&'a str>,
    pub feature_name: Option<&'a str>,
    pub feature_value: Option<&'a str>,
    pub gateway_serial: Option<&'a str>,
    pub account_id: &'a str,
}

/// Hex SHA-256 over the ordered identity tuple. Absent fields hash as empty strings.
pub fn event_hash(key: &EventKey<'_>) -> String {
    let fields = [
        format_ts(key.timestamp),
        key.event_type.to_string(),
        key.device_id.unwrap_or_default().to_string(),
        key.installation_id.to_string(),
        key.error_code.unwrap_or_default().to_string(),
        key.feature_name.unwrap_or_default().to_string(),
        key.feature_value.unwrap_or_default().to_string(),
        key.gateway_serial.unwrap_or_default().to_string(),
        key.account_id.to_string(),
    ];
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Builds an archived row from an upstream event. Returns `None` when the event has no timestamp.
pub fn new_event_from_wire(
    dto: &EventDto,
    account_id: &str,
    installation_id: &str,
    now: DateTime<Utc>,
) -> Option<NewEvent> {
    let timestamp = dto.event_timestamp.or(dto.created_at)?;
    let event_type = dto.event_type.clone().unwrap_or_else(|| "unknown".to_string());
    let body = dto.body.as_ref();

    let device_id = body.and_then(|b| b.device_id.as_ref()).map(|d| normalize_device_id(d.as_str()));
    let gateway_serial = dto.gateway_serial.as_ref().map(|g| g.0.clone());
    let error_code = body
        .and_then(|b| b.error_code.as_ref())
        .map(|c| c.as_str().to_string())
        .filter(|c| !c.is_empty());
    let feature_name = body.and_then(|b| b.feature_name.clone());
    let feature_value = body.and_then(|b| b.feature_value.as_ref()).map(scalar_text);
    let installation_id = dto
        .installation_id
        .as_ref()
        .map(|i| i.0.clone())
        .unwrap_or_else(|| installation_id.to_string());

    let hash = event_hash(&EventKey {
        timestamp,
        event_type: &event_type,
        device_id: device_id.as_deref(),
        installation_id: &installation_id,
        error_code: error_code.as_deref(),
        feature_name: feature_name.as_deref(),
        feature_value: feature_value.as_deref(),
        gateway_serial: gateway_serial.as_deref(),
        account_id,
    });

    let class = classify(&event_type, error_code.as_deref());
    let error_description = body
        .and_then(|b| b.error_description.clone())
        .or_else(|| class.description.map(str::to_string));

    Some(NewEvent {
        hash,
        event_time: timestamp.timestamp(),
        event_type,
        account_id: account_id.to_string(),
        installation_id,
        gateway_serial,
        device_id,
        error_code,
        error_description,
        category: class.category.to_string(),
        severity: class.severity.to_string(),
        feature_name,
        feature_value,
        active: body.and_then(|b| b.active),
        body: body.and_then(|b| serde_json::to_string(b).ok()),
        created_at: now.timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vicare::Page;
    use chrono::TimeZone;

    fn fixture_events(path: &str) -> Vec<EventDto> {
        let json = std::fs::read_to_string(path).expect("fixture present");
        let page: Page<EventDto> = serde_json::from_str(&json).expect("parse events");
        page.data
    }

    fn key(ts: DateTime<Utc>) -> EventKey<'static> {
        EventKey {
            timestamp: ts,
            event_type: "device-error",
            device_id: Some("0"),
            installation_id: "2048761",
            error_code: Some("F.454"),
            feature_name: None,
            feature_value: None,
            gateway_serial: Some("7736172143542227"),
            account_id: "a@example.com",
        }
    }

    #[test]
    fn hash_is_stable_and_field_sensitive() {
        let ts = Utc.with_ymd_and_hms(2024, 11, 5, 18, 42, 10).unwrap();
        let a = event_hash(&key(ts));
        assert_eq!(a, event_hash(&key(ts)));
        assert_eq!(a.len(), 64);

        let mut other = key(ts);
        other.account_id = "b@example.com";
        assert_ne!(a, event_hash(&other));

        // Moving a value to a neighbouring field must change the digest.
        let mut shifted = key(ts);
        shifted.feature_name = Some("F.454");
        shifted.error_code = None;
        assert_ne!(a, event_hash(&shifted));
    }

    #[test]
    fn wire_events_convert_with_normalized_keys() {
        let now = Utc::now();
        let events = fixture_events("tests/data/events-page-1.json");
        let rows: Vec<NewEvent> = events
            .iter()
            .filter_map(|e| new_event_from_wire(e, "a@example.com", "2048761", now))
            .collect();
        assert_eq!(rows.len(), 3);

        let fault = &rows[0];
        assert_eq!(fault.error_code.as_deref(), Some("F.454"));
        assert_eq!(fault.category, "fault");
        assert_eq!(fault.severity, "critical");
        assert_eq!(fault.active, Some(true));

        let change = &rows[1];
        assert_eq!(change.device_id.as_deref(), Some("0"));
        assert_eq!(change.feature_value.as_deref(), Some("50"));
        assert_eq!(change.installation_id, "2048761");

        let offline = &rows[2];
        assert_eq!(offline.installation_id, "2048761");
        assert_eq!(offline.gateway_serial.as_deref(), Some("7736172143542227"));
        assert_eq!(offline.category, "connectivity");
    }

    #[test]
    fn converting_twice_yields_identical_hashes() {
        let events = fixture_events("tests/data/events-page-2.json");
        let first = new_event_from_wire(&events[1], "a@example.com", "2048761", Utc::now()).unwrap();
        let second = new_event_from_wire(&events[1], "a@example.com", "2048761", Utc::now()).unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.error_description.as_deref(), Some("Domestic hot water heating"));
    }

    #[test]
    fn unknown_codes_fall_back_to_prefix() {
        assert_eq!(classify("device-error", Some("F.999")).category, "fault");
        assert_eq!(classify("device-error", Some("A.77")).severity, "warning");
        assert_eq!(classify("device-error", Some("X.1")).category, "info");
        assert_eq!(classify("device-error", None).severity, "info");
    }
}
