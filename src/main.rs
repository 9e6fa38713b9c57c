pub mod models {
    pub mod account;
    pub mod events;
    pub mod vicare;
}

pub mod client;
pub mod config;
pub mod credentials;
pub mod db {
    pub mod consumption;
    pub mod models;
    pub mod store;
}
pub mod pipeline;
pub mod schema;
pub mod utils;
pub mod services {
    pub mod archive;
    pub mod commands;
    pub mod feature_cache;
    pub mod fetch;
    pub mod rate_limit;
    pub mod sampler;
    pub mod scheduler;
    pub mod snapshot;
    pub mod tokens;
}
#[cfg(test)]
mod testing;

use crate::client::VendorClient;
use crate::config::Config;
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::pipeline::{Context, Pipeline};
use crate::services::rate_limit::RateLimiter;
use log::{error, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (database={}, credentials={}, api={}, feature_cache_ttl={}s, default_sample_interval={}min, http_timeout={}s)",
        cfg.database_path,
        cfg.credentials_file.display(),
        cfg.api_base_url,
        cfg.feature_cache_ttl.as_secs(),
        cfg.default_sample_interval_min,
        cfg.http_timeout.as_secs()
    );

    // 2) Credential store
    let credentials = Arc::new(FileCredentialStore::new(cfg.credentials_file.clone()));
    let accounts = credentials
        .load_accounts()
        .map_err(|e| format!("reading {} failed: {}", credentials.path().display(), e))?;
    let active = accounts.active().count();
    if active == 0 {
        warn!(
            "No active accounts in {}; schedulers will idle until one is added",
            credentials.path().display()
        );
    } else {
        info!("{} active account(s) of {}", active, accounts.accounts.len());
    }

    // 3) Open the store (applies migrations) and wire the pipeline
    let api = Arc::new(VendorClient::new(&cfg));
    let ctx = Context::new(cfg, api, credentials, Arc::new(RateLimiter::new())).map_err(|e| e.to_string())?;
    let pipeline = Pipeline::new(ctx);

    // 4) Start both cadences
    pipeline.start_all();

    // 5) Heartbeat
    loop {
        thread::sleep(HEARTBEAT_INTERVAL);
        let (short, long) = pipeline.rate_limit_usage();
        let archive = pipeline.archive_status();
        let sampler = pipeline.sampler_status();
        info!(
            "Heartbeat: rate limit {} / 10min, {} / 24h; archive running={} cycles={}; sampler running={} cycles={}",
            short, long, archive.running, archive.cycles, sampler.running, sampler.cycles
        );
        for (name, status) in [("Archive", &archive), ("Sampler", &sampler)] {
            if let Some(e) = &status.last_error {
                warn!("{}: last error: {}", name, e);
            }
        }
    }
}

/// Parses `--env-file <path>` / `--env-file=<path>`; anything else is rejected.
fn env_file_arg<I>(args: I) -> Result<Option<PathBuf>, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    let mut found: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        let arg = arg.into_string().map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let value = if arg == "--env-file" {
            args.next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?
        } else if let Some(rest) = arg.strip_prefix("--env-file=") {
            if rest.is_empty() {
                return Err("`--env-file` requires a path argument".to_string());
            }
            PathBuf::from(rest)
        } else if arg == "--" {
            break;
        } else {
            return Err(format!("unrecognised argument: {}", arg));
        };
        if found.replace(value).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(found)
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let (path, explicit) = match env_file_arg(std::env::args_os().skip(1))? {
        Some(path) if path.is_file() => (path, true),
        Some(path) => return Err(format!("env file not found: {}", path.display())),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let path = cwd.join(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };
    load_env_file(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit }))
}

// Values already present in the process environment win over the file.
fn load_env_file(path: &Path) -> Result<(), String> {
    dotenv::from_path(path).map_err(|e| format!("failed to load {}: {}", path.display(), e))
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "vicare-archiver {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
