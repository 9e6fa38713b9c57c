//! Credential store: accounts plus the settings of both collection cadences.
//!
//! The pipeline only sees the [`CredentialStore`] trait. [`FileCredentialStore`]
//! keeps everything in one JSON document next to the database.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::models::account::AccountStore;

#[derive(Debug)]
pub enum CredentialError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl core::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CredentialError::Io(e) => write!(f, "credential store io error: {}", e),
            CredentialError::Json(e) => write!(f, "credential store json error: {}", e),
        }
    }
}

impl std::error::Error for CredentialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CredentialError::Io(e) => Some(e),
            CredentialError::Json(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for CredentialError {
    fn from(value: std::io::Error) -> Self {
        CredentialError::Io(value)
    }
}

impl From<serde_json::Error> for CredentialError {
    fn from(value: serde_json::Error) -> Self {
        CredentialError::Json(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventArchiveSettings {
    pub enabled: bool,
    pub interval_minutes: u32,
    /// 0 keeps events forever.
    pub retention_days: u32,
    /// Size of the window requested on the first page of each fetch.
    pub days_back: u32,
}

impl Default for EventArchiveSettings {
    fn default() -> Self {
        EventArchiveSettings {
            enabled: true,
            interval_minutes: 60,
            retention_days: 365,
            days_back: 7,
        }
    }
}

impl EventArchiveSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes.max(1)) * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemperatureLogSettings {
    pub enabled: bool,
    pub sample_interval_minutes: u32,
    /// 0 keeps snapshots forever.
    pub retention_days: u32,
}

impl Default for TemperatureLogSettings {
    fn default() -> Self {
        TemperatureLogSettings {
            enabled: true,
            sample_interval_minutes: 5,
            retention_days: 90,
        }
    }
}

impl TemperatureLogSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sample_interval_minutes.max(1)) * 60)
    }
}

pub trait CredentialStore: Send + Sync {
    fn load_accounts(&self) -> Result<AccountStore, CredentialError>;
    fn save_accounts(&self, store: &AccountStore) -> Result<(), CredentialError>;
    fn load_event_archive_settings(&self) -> Result<EventArchiveSettings, CredentialError>;
    fn load_temperature_log_settings(&self) -> Result<TemperatureLogSettings, CredentialError>;
    fn save_event_archive_settings(&self, settings: &EventArchiveSettings) -> Result<(), CredentialError>;
    fn save_temperature_log_settings(&self, settings: &TemperatureLogSettings) -> Result<(), CredentialError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct CredentialsDocument {
    #[serde(flatten)]
    accounts: AccountStore,
    event_archive: EventArchiveSettings,
    temperature_log: TemperatureLogSettings,
}

pub struct FileCredentialStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the document.
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCredentialStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<CredentialsDocument, CredentialError> {
        match fs::read_to_string(&self.path) {
            Ok(s) if s.trim().is_empty() => Ok(CredentialsDocument::default()),
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CredentialsDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, doc: &CredentialsDocument) -> Result<(), CredentialError> {
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut CredentialsDocument)) -> Result<(), CredentialError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.read()?;
        f(&mut doc);
        self.write(&doc)
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_accounts(&self) -> Result<AccountStore, CredentialError> {
        Ok(self.read()?.accounts)
    }

    fn save_accounts(&self, store: &AccountStore) -> Result<(), CredentialError> {
        self.update(|doc| doc.accounts = store.clone())
    }

    fn load_event_archive_settings(&self) -> Result<EventArchiveSettings, CredentialError> {
        Ok(self.read()?.event_archive)
    }

    fn load_temperature_log_settings(&self) -> Result<TemperatureLogSettings, CredentialError> {
        Ok(self.read()?.temperature_log)
    }

    fn save_event_archive_settings(&self, settings: &EventArchiveSettings) -> Result<(), CredentialError> {
        self.update(|doc| doc.event_archive = settings.clone())
    }

    fn save_temperature_log_settings(&self, settings: &TemperatureLogSettings) -> Result<(), CredentialError> {
        self.update(|doc| doc.temperature_log = settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::{Account, Credentials};

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            name: "Home".to_string(),
            credentials: Credentials {
                email: id.to_string(),
                password: "secret".to_string(),
                client_id: "client".to_string(),
                client_secret: None,
            },
            active: true,
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("creds.json"));
        assert!(store.load_accounts().unwrap().accounts.is_empty());
        assert_eq!(store.load_event_archive_settings().unwrap(), EventArchiveSettings::default());
        assert_eq!(
            store.load_temperature_log_settings().unwrap(),
            TemperatureLogSettings::default()
        );
    }

    #[test]
    fn saves_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("creds.json"));

        store
            .save_accounts(&AccountStore {
                accounts: vec![account("a@example.com")],
            })
            .unwrap();
        let settings = TemperatureLogSettings {
            enabled: false,
            sample_interval_minutes: 10,
            retention_days: 30,
        };
        store.save_temperature_log_settings(&settings).unwrap();

        assert_eq!(store.load_accounts().unwrap().accounts, vec![account("a@example.com")]);
        assert_eq!(store.load_temperature_log_settings().unwrap(), settings);
        assert_eq!(store.load_event_archive_settings().unwrap(), EventArchiveSettings::default());
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, r#"{"eventArchive": {"intervalMinutes": 15}}"#).unwrap();
        let store = FileCredentialStore::new(path);
        let settings = store.load_event_archive_settings().unwrap();
        assert_eq!(settings.interval_minutes, 15);
        assert_eq!(settings.days_back, 7);
        assert_eq!(settings.interval(), Duration::from_secs(900));
    }
}
