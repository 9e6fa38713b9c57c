//! Short-lived cache of per-device feature snapshots.
//!
//! Both the sampler and on-demand readers go through this cache, so a device is
//! fetched at most once per TTL. An upstream failure (or an exhausted rate limit)
//! falls back to the last cached snapshot when one exists. A rejected token is
//! always surfaced so the caller can re-authenticate.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::client::{ClientError, VendorApi};
use crate::models::vicare::FeatureDto;
use crate::services::rate_limit::RateLimiter;
use crate::services::tokens::AuthError;

#[derive(Debug)]
pub enum FeatureError {
    RateLimited,
    Auth(AuthError),
    Client(ClientError),
}

impl core::fmt::Display for FeatureError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FeatureError::RateLimited => write!(f, "rate limit reached and no cached features"),
            FeatureError::Auth(e) => write!(f, "{}", e),
            FeatureError::Client(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FeatureError {}

impl FeatureError {
    /// True when upstream rejected the access token itself.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FeatureError::Client(e) if e.is_unauthorized())
    }
}

impl From<AuthError> for FeatureError {
    fn from(value: AuthError) -> Self {
        FeatureError::Auth(value)
    }
}

impl From<ClientError> for FeatureError {
    fn from(value: ClientError) -> Self {
        FeatureError::Client(value)
    }
}

/// Device identity: `(installation, gateway serial, device id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub installation_id: String,
    pub gateway_serial: String,
    pub device_id: String,
}

impl DeviceKey {
    pub fn new(installation_id: &str, gateway_serial: &str, device_id: &str) -> Self {
        DeviceKey {
            installation_id: installation_id.to_string(),
            gateway_serial: gateway_serial.to_string(),
            device_id: device_id.to_string(),
        }
    }
}

impl core::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}/{}", self.installation_id, self.gateway_serial, self.device_id)
    }
}

/// Feature snapshot of one device, indexed by feature name.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub fetched_at: DateTime<Utc>,
    pub by_name: BTreeMap<String, FeatureDto>,
}

impl Features {
    pub fn new(list: Vec<FeatureDto>, fetched_at: DateTime<Utc>) -> Self {
        Features {
            fetched_at,
            by_name: list.into_iter().map(|f| (f.feature.clone(), f)).collect(),
        }
    }

    fn property(&self, feature: &str, property: &str) -> Option<(&Value, Option<&str>)> {
        let f = self.by_name.get(feature)?;
        if f.is_enabled == Some(false) {
            return None;
        }
        let p = f.properties.get(property)?;
        Some((p.value.as_ref()?, p.unit.as_deref()))
    }

    /// Numeric property, with power reported in kilowatt converted to watt.
    pub fn number(&self, feature: &str, property: &str) -> Option<f64> {
        let (value, unit) = self.property(feature, property)?;
        let n = value.as_f64()?;
        match unit {
            Some("kilowatt") => Some(n * 1000.0),
            _ => Some(n),
        }
    }

    /// Boolean property; `status` strings such as `on`/`off` count as booleans.
    pub fn boolean(&self, feature: &str, property: &str) -> Option<bool> {
        let (value, _) = self.property(feature, property)?;
        match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "on" | "active" | "true" => Some(true),
                "off" | "inactive" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn text(&self, feature: &str, property: &str) -> Option<String> {
        let (value, _) = self.property(feature, property)?;
        value.as_str().map(str::to_string)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

struct CachedFeatures {
    stored_at: Instant,
    features: Arc<Features>,
}

pub struct FeatureCache {
    api: Arc<dyn VendorApi>,
    limiter: Arc<RateLimiter>,
    default_ttl: Duration,
    entries: RwLock<HashMap<DeviceKey, CachedFeatures>>,
}

impl FeatureCache {
    pub fn new(api: Arc<dyn VendorApi>, limiter: Arc<RateLimiter>, default_ttl: Duration) -> Self {
        FeatureCache {
            api,
            limiter,
            default_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &DeviceKey, access_token: &str) -> Result<Arc<Features>, FeatureError> {
        self.get_with_ttl(key, access_token, self.default_ttl)
    }

    pub fn get_with_ttl(&self, key: &DeviceKey, access_token: &str, ttl: Duration) -> Result<Arc<Features>, FeatureError> {
        let cached = self.lookup(key);
        if let Some((age, features)) = &cached {
            if *age < ttl {
                debug!("Features: cache hit for {} (age {}s)", key, age.as_secs());
                return Ok(features.clone());
            }
        }

        if !self.limiter.try_acquire() {
            return match cached {
                Some((_, stale)) => {
                    warn!("Features: rate limit reached, serving stale features for {}", key);
                    Ok(stale)
                }
                None => Err(FeatureError::RateLimited),
            };
        }

        match self
            .api
            .features(access_token, &key.installation_id, &key.gateway_serial, &key.device_id)
        {
            Ok(list) => {
                let features = Arc::new(Features::new(list, Utc::now()));
                self.entries.write().unwrap_or_else(PoisonError::into_inner).insert(
                    key.clone(),
                    CachedFeatures {
                        stored_at: Instant::now(),
                        features: features.clone(),
                    },
                );
                Ok(features)
            }
            Err(e) if e.is_unauthorized() => Err(FeatureError::Client(e)),
            Err(e) => match cached {
                Some((_, stale)) => {
                    warn!("Features: fetch failed for {}, serving stale features: {}", key, e);
                    Ok(stale)
                }
                None => Err(FeatureError::Client(e)),
            },
        }
    }

    fn lookup(&self, key: &DeviceKey) -> Option<(Duration, Arc<Features>)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|e| (e.stored_at.elapsed(), e.features.clone()))
    }

    /// Drops the entry so the next read goes upstream.
    pub fn invalidate(&self, key: &DeviceKey) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
