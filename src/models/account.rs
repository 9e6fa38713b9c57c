//! Accounts, their cached tokens and the installation tree resolved at login.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::vicare::{AddressDto, DeviceDto, GatewayDto, InstallationDto};
use crate::utils::normalize_device_id;

/// Tokens are considered stale this long before their reported expiry.
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Stable external identifier, usually the login email.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountStore {
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl AccountStore {
    pub fn active(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter().filter(|a| a.active)
    }

    pub fn find(&self, id: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Normalized device id (see [`normalize_device_id`]).
    pub id: String,
    pub model_id: Option<String>,
    pub device_type: Option<String>,
    pub status: Option<String>,
}

impl Device {
    /// Devices whose features carry the heat generator readings sampled into snapshots.
    pub fn is_heating(&self) -> bool {
        self.id == "0" || self.device_type.as_deref() == Some("heating")
    }
}

impl From<DeviceDto> for Device {
    fn from(value: DeviceDto) -> Self {
        Device {
            id: normalize_device_id(value.id.as_str()),
            model_id: value.model_id,
            device_type: value.device_type,
            status: value.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub serial: String,
    pub version: Option<String>,
    pub gateway_type: Option<String>,
    pub devices: Vec<Device>,
}

impl From<GatewayDto> for Gateway {
    fn from(value: GatewayDto) -> Self {
        Gateway {
            serial: value.serial.0,
            version: value.version,
            gateway_type: value.gateway_type,
            devices: value.devices.into_iter().map(Device::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub gateways: Vec<Gateway>,
}

fn format_address(a: &AddressDto) -> Option<String> {
    let street = [a.street.as_deref(), a.house_number.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    let town = [a.zip.as_deref(), a.city.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    let parts = [street.as_str(), town.as_str(), a.country.as_deref().unwrap_or("")]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    (!parts.is_empty()).then(|| parts.join(", "))
}

impl From<InstallationDto> for Installation {
    fn from(value: InstallationDto) -> Self {
        Installation {
            id: value.id.0,
            description: value.description,
            address: value.address.as_ref().and_then(format_address),
            gateways: value.gateways.into_iter().map(Gateway::from).collect(),
        }
    }
}

/// Everything the pipeline knows about a logged-in account.
///
/// Never mutated in place: a refresh builds a complete new value which replaces the
/// cached one, so readers never see a new token paired with a stale installation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub installations: Vec<Installation>,
}

impl AccountToken {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) < self.expires_at
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    pub fn installation_ids(&self) -> Vec<&str> {
        self.installations.iter().map(|i| i.id.as_str()).collect()
    }

    pub fn installation(&self, id: &str) -> Option<&Installation> {
        self.installations.iter().find(|i| i.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vicare::{InstallationDto, Page};

    #[test]
    fn converts_installation_tree_with_normalized_ids() {
        let json = std::fs::read_to_string("tests/data/installations-page.json").expect("fixture present");
        let page: Page<InstallationDto> = serde_json::from_str(&json).expect("parse installations");
        let inst = Installation::from(page.data.into_iter().next().unwrap());

        assert_eq!(inst.id, "2048761");
        assert_eq!(inst.address.as_deref(), Some("Hauptstrasse 12, 35108 Allendorf, DE"));
        let devices: Vec<&str> = inst.gateways[0].devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(devices, vec!["0", "RoomControl-1", "zigbee-048d1234"]);
        assert!(inst.gateways[0].devices[0].is_heating());
        assert!(!inst.gateways[0].devices[2].is_heating());
    }

    #[test]
    fn freshness_respects_margin() {
        let now = Utc::now();
        let token = AccountToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: now + Duration::seconds(10),
            installations: vec![],
        };
        assert!(!token.is_fresh_at(now));
        assert!(token.is_fresh_at(now - Duration::seconds(60)));
    }

    #[test]
    fn account_store_filters_inactive() {
        let json = r#"{"accounts": [
            {"id": "a@example.com", "email": "a@example.com", "password": "x", "clientId": "c"},
            {"id": "b@example.com", "email": "b@example.com", "password": "y", "clientId": "c", "active": false}
        ]}"#;
        let store: AccountStore = serde_json::from_str(json).unwrap();
        let active: Vec<&str> = store.active().map(|a| a.id.as_str()).collect();
        assert_eq!(active, vec!["a@example.com"]);
        assert!(store.find("b@example.com").is_some());
    }
}
