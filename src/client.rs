//! Blocking HTTP client for the ViCare IoT API (subset used by the archiver).
//!
//! - Blocking client using `ureq` (no async).
//! - Endpoints: OAuth2 authorization code + PKCE, refresh grant, paginated
//!   equipment listing, paginated events history, device features, feature commands.
//! - The client never retries and never consults the rate limiter; callers do both.
//!
//! Authentication
//! - Credentials are POSTed to the authorize endpoint with redirects disabled; the
//!   authorization code is read from the `Location` header of the 302 response and
//!   exchanged for an access/refresh token pair.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, SecondsFormat, Utc};
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::Config;
use crate::models::account::Credentials;
use crate::models::vicare::*;

pub const PAGE_SIZE: u32 = 1000;
const OAUTH_SCOPE: &str = "IoT User offline_access";

#[derive(Debug)]
pub enum ClientError {
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
    Auth(String),
    MissingAuthorizationCode,
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            ClientError::Json(e) => write!(f, "json error: {}", e),
            ClientError::Auth(e) => write!(f, "auth error: {}", e),
            ClientError::MissingAuthorizationCode => {
                write!(f, "authorize response carried no authorization code")
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ureq::Error> for ClientError {
    fn from(value: ureq::Error) -> Self {
        ClientError::Transport(value.to_string())
    }
}

impl ClientError {
    /// True for failures caused by rejected credentials rather than the network.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Auth(_)) || matches!(self, ClientError::Http { status: 401, .. })
    }
}

/// Result of a successful authorization or refresh grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenGrant {
    fn from_response(r: TokenResponse, now: DateTime<Utc>) -> Self {
        TokenGrant {
            access_token: r.access_token,
            refresh_token: r.refresh_token,
            expires_at: now + chrono::Duration::seconds(r.expires_in.min(i64::MAX as u64) as i64),
        }
    }
}

/// Time window for the first page of an events-history listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Upstream operations the pipeline depends on.
///
/// Implemented by [`VendorClient`] over HTTP; tests substitute scripted fakes.
pub trait VendorApi: Send + Sync {
    /// Full authorization-code-with-PKCE exchange.
    fn authorize(&self, credentials: &Credentials) -> Result<TokenGrant, ClientError>;

    fn refresh(&self, credentials: &Credentials, refresh_token: &str) -> Result<TokenGrant, ClientError>;

    fn installations_page(&self, access_token: &str, cursor: Option<&str>) -> Result<Page<InstallationDto>, ClientError>;

    /// One page of event history. `window` is only sent when `cursor` is `None`.
    fn events_page(
        &self,
        access_token: &str,
        installation_id: &str,
        window: &EventWindow,
        cursor: Option<&str>,
    ) -> Result<Page<EventDto>, ClientError>;

    fn features(
        &self,
        access_token: &str,
        installation_id: &str,
        gateway_serial: &str,
        device_id: &str,
    ) -> Result<Vec<FeatureDto>, ClientError>;

    fn execute_command(
        &self,
        access_token: &str,
        installation_id: &str,
        gateway_serial: &str,
        device_id: &str,
        feature: &str,
        command: &str,
        params: &Value,
    ) -> Result<(), ClientError>;
}

/// PKCE verifier/challenge pair (RFC 7636, S256).
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Pkce { verifier, challenge }
    }
}

/// Extracts the percent-decoded `code` query parameter from a redirect `Location`.
///
/// Relative locations are resolved against a placeholder base; only the query matters.
pub fn authorization_code_from_location(location: &str) -> Option<String> {
    let url = Url::parse(location)
        .or_else(|_| Url::parse("http://localhost/").and_then(|base| base.join(location)))
        .ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

pub struct VendorClient {
    api: ureq::Agent,
    // Redirects disabled so the authorization code can be read off the 302.
    iam: ureq::Agent,
    api_base_url: String,
    iam_base_url: String,
    redirect_uri: String,
}

impl VendorClient {
    pub fn new(cfg: &Config) -> Self {
        let timeout = Some(cfg.http_timeout);
        let api: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(timeout)
            .http_status_as_error(false)
            .build()
            .into();
        let iam: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(timeout)
            .http_status_as_error(false)
            .max_redirects(0)
            .max_redirects_will_error(false)
            .build()
            .into();

        VendorClient {
            api,
            iam,
            api_base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            iam_base_url: cfg.iam_base_url.trim_end_matches('/').to_string(),
            redirect_uri: cfg.redirect_uri.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.api_base_url, path)
        } else {
            format!("{}/{}", self.api_base_url, path)
        }
    }

    fn read_json<T: DeserializeOwned>(mut resp: http::Response<ureq::Body>) -> Result<T, ClientError> {
        let status = resp.status();
        let body = resp.body_mut().read_to_string()?;
        if !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        let de = &mut serde_json::Deserializer::from_str(&body);
        serde_path_to_error::deserialize(de).map_err(|e| ClientError::Json(e.to_string()))
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let mut req = self
            .api
            .get(&self.url(path))
            .header("Accept", "application/json")
            .header("Authorization", &format!("Bearer {}", access_token));
        for (k, v) in query {
            req = req.query(*k, v);
        }
        Self::read_json(req.call()?)
    }

    fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ClientError> {
        let resp = self
            .iam
            .post(&format!("{}/token", self.iam_base_url))
            .header("Accept", "application/json")
            .send_form(form.iter().copied())?;
        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::BAD_REQUEST {
            let status = resp.status().as_u16();
            let mut resp = resp;
            let body = resp.body_mut().read_to_string().unwrap_or_default();
            return Err(ClientError::Auth(format!("token endpoint http {}: {}", status, body)));
        }
        let token: TokenResponse = Self::read_json(resp)?;
        Ok(TokenGrant::from_response(token, Utc::now()))
    }

    fn request_authorization_code(&self, credentials: &Credentials, pkce: &Pkce) -> Result<String, ClientError> {
        let basic = STANDARD.encode(format!("{}:{}", credentials.email, credentials.password));
        let resp = self
            .iam
            .post(&format!("{}/authorize", self.iam_base_url))
            .query("client_id", &credentials.client_id)
            .query("redirect_uri", &self.redirect_uri)
            .query("scope", OAUTH_SCOPE)
            .query("response_type", "code")
            .query("code_challenge_method", "S256")
            .query("code_challenge", &pkce.challenge)
            .header("Authorization", &format!("Basic {}", basic))
            .send_empty()?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Auth("invalid credentials".to_string()));
        }
        if !status.is_redirection() {
            let mut resp = resp;
            let body = resp.body_mut().read_to_string().unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        resp.headers()
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(authorization_code_from_location)
            .ok_or(ClientError::MissingAuthorizationCode)
    }
}

impl VendorApi for VendorClient {
    fn authorize(&self, credentials: &Credentials) -> Result<TokenGrant, ClientError> {
        let pkce = Pkce::generate();
        let code = self.request_authorization_code(credentials, &pkce)?;
        let mut form = vec![
            ("client_id", credentials.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
            ("code_verifier", pkce.verifier.as_str()),
            ("code", code.as_str()),
        ];
        if let Some(secret) = credentials.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        self.token_request(&form)
    }

    fn refresh(&self, credentials: &Credentials, refresh_token: &str) -> Result<TokenGrant, ClientError> {
        let mut form = vec![
            ("client_id", credentials.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(secret) = credentials.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        self.token_request(&form)
    }

    fn installations_page(&self, access_token: &str, cursor: Option<&str>) -> Result<Page<InstallationDto>, ClientError> {
        let mut q = vec![
            ("includeGateways", "true".to_string()),
            ("limit", PAGE_SIZE.to_string()),
        ];
        if let Some(c) = cursor {
            q.push(("cursor", c.to_string()));
        }
        self.get_json("/iot/v2/equipment/installations", access_token, &q)
    }

    fn events_page(
        &self,
        access_token: &str,
        installation_id: &str,
        window: &EventWindow,
        cursor: Option<&str>,
    ) -> Result<Page<EventDto>, ClientError> {
        let mut q = vec![("limit", PAGE_SIZE.to_string())];
        match cursor {
            Some(c) => q.push(("cursor", c.to_string())),
            None => {
                q.push(("start", window.start.to_rfc3339_opts(SecondsFormat::Millis, true)));
                q.push(("end", window.end.to_rfc3339_opts(SecondsFormat::Millis, true)));
            }
        }
        self.get_json(
            &format!("/iot/v2/events-history/installations/{}/events", installation_id),
            access_token,
            &q,
        )
    }

    fn features(
        &self,
        access_token: &str,
        installation_id: &str,
        gateway_serial: &str,
        device_id: &str,
    ) -> Result<Vec<FeatureDto>, ClientError> {
        let list: FeatureList = self.get_json(
            &format!(
                "/iot/v2/features/installations/{}/gateways/{}/devices/{}/features",
                installation_id, gateway_serial, device_id
            ),
            access_token,
            &[],
        )?;
        Ok(list.data)
    }

    fn execute_command(
        &self,
        access_token: &str,
        installation_id: &str,
        gateway_serial: &str,
        device_id: &str,
        feature: &str,
        command: &str,
        params: &Value,
    ) -> Result<(), ClientError> {
        let url = self.url(&format!(
            "/iot/v2/features/installations/{}/gateways/{}/devices/{}/features/{}/commands/{}",
            installation_id, gateway_serial, device_id, feature, command
        ));
        let mut resp = self
            .api
            .post(&url)
            .header("Accept", "application/json")
            .header("Authorization", &format!("Bearer {}", access_token))
            .send_json(params)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.body_mut().read_to_string().unwrap_or_default();
        Err(ClientError::Http {
            status: status.as_u16(),
            message: body,
        })
    }
}
