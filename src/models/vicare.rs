//! Wire models for the subset of the ViCare IoT API the archiver consumes.
//!
//! Notes
//! - Only fields the pipeline reads are modeled; everything else is ignored by serde.
//! - Identifiers are deserialized through [`FlexId`] because the API sends the same
//!   id as a JSON string on some endpoints and as a number on others.

use chrono::{DateTime, Utc};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::utils::canonical_number_id;

// =====================
// Identifiers
// =====================

/// Identifier accepted as either a JSON string or a JSON number, stored in canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct FlexId(pub String);

impl<'de> serde::Deserialize<'de> for FlexId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = FlexId;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "a string or numeric identifier")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(FlexId(value.trim().to_string()))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(FlexId(value.to_string()))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(FlexId(value.to_string()))
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                canonical_number_id(value)
                    .map(FlexId)
                    .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Float(value), &self))
            }
        }

        deserializer.deserialize_any(V)
    }
}

impl FlexId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// =====================
// Pagination envelope
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Cursor {
    pub next: Option<String>,
}

/// Envelope shared by every cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct Page<T> {
    #[serde(default = "Vec::new", deserialize_with = "skip_malformed")]
    pub data: Vec<T>,
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

/// Entries that fail to parse are logged and dropped so they cannot take the
/// rest of the page down with them.
fn skip_malformed<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Vec::<Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| match serde_json::from_value(entry) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Fetch: dropping malformed entry {} of page: {}", i, e);
                None
            }
        })
        .collect())
}

impl<T> Page<T> {
    /// Cursor for the following page, if the server supplied a non-empty one.
    pub fn next_cursor(&self) -> Option<&str> {
        self.cursor
            .as_ref()
            .and_then(|c| c.next.as_deref())
            .filter(|s| !s.trim().is_empty())
    }
}

// =====================
// OAuth
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: Option<String>,
}

// =====================
// Equipment
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AddressDto {
    pub street: Option<String>,
    pub house_number: Option<String>,
    pub zip: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDto {
    pub id: FlexId,
    pub model_id: Option<String>,
    pub device_type: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GatewayDto {
    pub serial: FlexId,
    pub version: Option<String>,
    pub gateway_type: Option<String>,
    pub aggregated_status: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstallationDto {
    pub id: FlexId,
    pub description: Option<String>,
    pub address: Option<AddressDto>,
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gateways: Vec<GatewayDto>,
}

// =====================
// Events history
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventBodyDto {
    pub error_code: Option<FlexId>,
    pub error_description: Option<String>,
    pub equipment_type: Option<String>,
    pub active: Option<bool>,
    pub device_id: Option<FlexId>,
    pub feature_name: Option<String>,
    pub feature_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventDto {
    pub event_timestamp: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub gateway_serial: Option<FlexId>,
    pub installation_id: Option<FlexId>,
    #[serde(default)]
    pub body: Option<EventBodyDto>,
}

// =====================
// Features
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PropertyDto {
    pub r#type: Option<String>,
    pub value: Option<Value>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDto {
    pub feature: String,
    pub gateway_id: Option<FlexId>,
    pub device_id: Option<FlexId>,
    pub timestamp: Option<DateTime<Utc>>,
    pub is_enabled: Option<bool>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDto>,
    #[serde(default)]
    pub commands: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureList {
    #[serde(default)]
    pub data: Vec<FeatureDto>,
}
