//! Minimal runtime configuration helpers.
//! Cadence settings (intervals, retention) are not here: they live in the
//! credential store and are re-read whenever a scheduler starts.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATABASE_PATH: &str = "vicare.db";
pub const DEFAULT_CREDENTIALS_FILE: &str = "vicare-credentials.json";
pub const DEFAULT_API_BASE_URL: &str = "https://api.viessmann.com";
pub const DEFAULT_IAM_BASE_URL: &str = "https://iam.viessmann.com/idp/v3";
pub const DEFAULT_REDIRECT_URI: &str = "vicare://oauth-callback/everest";
pub const DEFAULT_FEATURE_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_SAMPLE_INTERVAL_MIN: i32 = 5;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file.
    pub database_path: String,
    /// JSON document holding accounts and cadence settings.
    pub credentials_file: PathBuf,
    pub api_base_url: String,
    pub iam_base_url: String,
    pub redirect_uri: String,
    /// Default lifetime of cached device features.
    pub feature_cache_ttl: Duration,
    /// Interval assumed for snapshot rows that predate the per-row interval column.
    pub default_sample_interval_min: i32,
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            credentials_file: PathBuf::from(DEFAULT_CREDENTIALS_FILE),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            iam_base_url: DEFAULT_IAM_BASE_URL.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            feature_cache_ttl: Duration::from_secs(DEFAULT_FEATURE_CACHE_TTL_SECS),
            default_sample_interval_min: DEFAULT_SAMPLE_INTERVAL_MIN,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a number, got {:?}", key, v)),
        _ => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_path = env_string("DATABASE_PATH", DEFAULT_DATABASE_PATH);
        let credentials_file = PathBuf::from(env_string("CREDENTIALS_FILE", DEFAULT_CREDENTIALS_FILE));
        let api_base_url = env_string("VICARE_API_BASE_URL", DEFAULT_API_BASE_URL);
        let iam_base_url = env_string("VICARE_IAM_BASE_URL", DEFAULT_IAM_BASE_URL);
        let redirect_uri = env_string("VICARE_REDIRECT_URI", DEFAULT_REDIRECT_URI);

        let feature_cache_ttl_secs = env_parsed("FEATURE_CACHE_TTL_SECS", DEFAULT_FEATURE_CACHE_TTL_SECS)?;
        let default_sample_interval_min = env_parsed("DEFAULT_SAMPLE_INTERVAL_MIN", DEFAULT_SAMPLE_INTERVAL_MIN)?;
        if default_sample_interval_min <= 0 {
            return Err("DEFAULT_SAMPLE_INTERVAL_MIN must be positive".to_string());
        }
        let http_timeout_secs = env_parsed("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;

        Ok(Config {
            database_path,
            credentials_file,
            api_base_url,
            iam_base_url,
            redirect_uri,
            feature_cache_ttl: Duration::from_secs(feature_cache_ttl_secs),
            default_sample_interval_min,
            http_timeout: Duration::from_secs(http_timeout_secs.max(1)),
        })
    }
}
