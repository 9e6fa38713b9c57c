//! Scripted stand-in for the vendor API, backed by the JSON fixtures in `tests/data/`.

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::client::{ClientError, EventWindow, TokenGrant, VendorApi};
use crate::config::Config;
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::models::account::{Account, AccountStore, Credentials};
use crate::models::vicare::{EventDto, FeatureDto, FeatureList, InstallationDto, Page};
use crate::pipeline::Context;
use crate::services::rate_limit::RateLimiter;

pub fn test_account(id: &str) -> Account {
    Account {
        id: id.to_string(),
        name: format!("Account {}", id),
        credentials: Credentials {
            email: id.to_string(),
            password: "secret".to_string(),
            client_id: "client".to_string(),
            client_secret: None,
        },
        active: true,
    }
}

/// Context over a throwaway database and credential file holding the given accounts.
pub fn test_context(api: Arc<FakeApi>, limiter: RateLimiter, account_ids: &[&str]) -> (tempfile::TempDir, Arc<Context>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let credentials_file = dir.path().join("credentials.json");
    let credentials = FileCredentialStore::new(&credentials_file);
    credentials
        .save_accounts(&AccountStore {
            accounts: account_ids.iter().map(|id| test_account(id)).collect(),
        })
        .expect("save accounts");
    let config = Config {
        database_path: dir.path().join("archive.db").to_string_lossy().into_owned(),
        credentials_file,
        ..Config::default()
    };
    let ctx = Context::new(config, api, Arc::new(credentials), Arc::new(limiter)).expect("open context");
    (dir, Arc::new(ctx))
}

fn fixture<T: serde::de::DeserializeOwned>(path: &str) -> T {
    let json = std::fs::read_to_string(path).expect("fixture present");
    serde_json::from_str(&json).expect("fixture parses")
}

#[derive(Default)]
struct Script {
    installations: Option<Page<InstallationDto>>,
    event_pages: Vec<Page<EventDto>>,
    endless_events: bool,
    features: Vec<FeatureDto>,
    token_lifetime: Option<Duration>,
    auth_delay: Option<std::time::Duration>,
}

#[derive(Default)]
pub struct FakeApi {
    script: Mutex<Script>,
    reject_credentials: AtomicBool,
    fail_events: AtomicBool,
    fail_features: AtomicBool,
    reject_tokens: AtomicBool,
    authorize_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    installation_page_calls: AtomicUsize,
    event_page_calls: AtomicUsize,
    feature_calls: AtomicUsize,
    command_calls: AtomicUsize,
    issued: AtomicUsize,
}

impl FakeApi {
    /// Installations, two event pages and one feature list from `tests/data/`.
    pub fn with_fixtures() -> Self {
        let api = FakeApi::default();
        {
            let mut s = api.script();
            s.installations = Some(fixture("tests/data/installations-page.json"));
            s.event_pages = vec![
                fixture("tests/data/events-page-1.json"),
                fixture("tests/data/events-page-2.json"),
            ];
            s.features = fixture::<FeatureList>("tests/data/features.json").data;
        }
        api
    }

    /// Every events page carries one distinct event and a next cursor.
    pub fn with_endless_events() -> Self {
        let api = Self::with_fixtures();
        api.script().endless_events = true;
        api
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_token_lifetime(&self, lifetime: Duration) {
        self.script().token_lifetime = Some(lifetime);
    }

    pub fn set_auth_delay(&self, delay: std::time::Duration) {
        self.script().auth_delay = Some(delay);
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.reject_credentials.store(reject, Ordering::SeqCst);
    }

    pub fn fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    pub fn fail_features(&self, fail: bool) {
        self.fail_features.store(fail, Ordering::SeqCst);
    }

    /// Feature reads answer 401 as if the access token had been revoked.
    pub fn reject_tokens(&self, reject: bool) {
        self.reject_tokens.store(reject, Ordering::SeqCst);
    }

    pub fn reset_counters(&self) {
        for c in [
            &self.authorize_calls,
            &self.refresh_calls,
            &self.installation_page_calls,
            &self.event_page_calls,
            &self.feature_calls,
            &self.command_calls,
        ] {
            c.store(0, Ordering::SeqCst);
        }
    }

    pub fn authorize_calls(&self) -> usize {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn installation_page_calls(&self) -> usize {
        self.installation_page_calls.load(Ordering::SeqCst)
    }

    pub fn event_page_calls(&self) -> usize {
        self.event_page_calls.load(Ordering::SeqCst)
    }

    pub fn feature_calls(&self) -> usize {
        self.feature_calls.load(Ordering::SeqCst)
    }

    pub fn command_calls(&self) -> usize {
        self.command_calls.load(Ordering::SeqCst)
    }

    fn grant(&self) -> TokenGrant {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let lifetime = self.script().token_lifetime.unwrap_or_else(|| Duration::hours(1));
        TokenGrant {
            access_token: format!("access-{}", n),
            refresh_token: Some(format!("refresh-{}", n)),
            expires_at: Utc::now() + lifetime,
        }
    }

    fn endless_page(n: usize) -> Page<EventDto> {
        let ts = Utc::now() - Duration::minutes(n as i64);
        serde_json::from_value(json!({
            "data": [{
                "eventTimestamp": ts.to_rfc3339(),
                "eventType": "feature-changed",
                "gatewaySerial": "7736172143542227",
                "installationId": "2048761",
                "body": {"deviceId": "0", "featureName": "heating.sensors.temperature.outside", "featureValue": n}
            }],
            "cursor": {"next": format!("endless-{}", n + 1)}
        }))
        .expect("endless page")
    }
}

impl VendorApi for FakeApi {
    fn authorize(&self, _credentials: &Credentials) -> Result<TokenGrant, ClientError> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script().auth_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(ClientError::Auth("invalid credentials".to_string()));
        }
        Ok(self.grant())
    }

    fn refresh(&self, _credentials: &Credentials, _refresh_token: &str) -> Result<TokenGrant, ClientError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(ClientError::Auth("refresh token revoked".to_string()));
        }
        Ok(self.grant())
    }

    fn installations_page(&self, _access_token: &str, _cursor: Option<&str>) -> Result<Page<InstallationDto>, ClientError> {
        self.installation_page_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script().installations.clone().unwrap_or(Page {
            data: Vec::new(),
            cursor: None,
        }))
    }

    fn events_page(
        &self,
        _access_token: &str,
        _installation_id: &str,
        _window: &EventWindow,
        cursor: Option<&str>,
    ) -> Result<Page<EventDto>, ClientError> {
        let n = self.event_page_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(ClientError::Http {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        let s = self.script();
        if s.endless_events {
            return Ok(Self::endless_page(n));
        }
        // Cursors of the fixture pages are "page-<n>".
        let index = match cursor {
            None => 0,
            Some(c) => c
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .map(|n| n.saturating_sub(1))
                .unwrap_or(usize::MAX),
        };
        Ok(s.event_pages.get(index).cloned().unwrap_or(Page {
            data: Vec::new(),
            cursor: None,
        }))
    }

    fn features(
        &self,
        _access_token: &str,
        _installation_id: &str,
        _gateway_serial: &str,
        _device_id: &str,
    ) -> Result<Vec<FeatureDto>, ClientError> {
        self.feature_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_features.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection reset".to_string()));
        }
        if self.reject_tokens.load(Ordering::SeqCst) {
            return Err(ClientError::Http {
                status: 401,
                message: "expired".to_string(),
            });
        }
        Ok(self.script().features.clone())
    }

    fn execute_command(
        &self,
        _access_token: &str,
        _installation_id: &str,
        _gateway_serial: &str,
        _device_id: &str,
        _feature: &str,
        _command: &str,
        _params: &Value,
    ) -> Result<(), ClientError> {
        self.command_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
