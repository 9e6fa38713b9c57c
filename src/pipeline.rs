//! Shared pipeline context and the facade consumed by the presentation layer.
//!
//! [`Context`] is built once at startup and handed to both schedulers as an `Arc`;
//! it owns the rate limiter, token manager, feature cache and store. [`Pipeline`]
//! adds the two schedulers and the on-demand operations.

use chrono::Utc;
use log::{error, info, warn};
use serde_json::Value;
use std::sync::Arc;

use crate::client::{ClientError, VendorApi};
use crate::config::Config;
use crate::credentials::{CredentialError, CredentialStore, EventArchiveSettings, TemperatureLogSettings};
use crate::db::consumption::{Bucket, ConsumptionBucket};
use crate::db::models::{Event, TemperatureSnapshot};
use crate::db::store::{EventFilter, EventStats, SnapshotFilter, Store, StoreError};
use crate::models::account::{Account, Installation};
use crate::services::archive::{ArchiveOutcome, EventArchiveJob, archive_installation};
use crate::services::commands::{CommandRequest, execute_command};
use crate::services::feature_cache::{DeviceKey, FeatureCache, FeatureError, Features};
use crate::services::fetch::SyncMode;
use crate::services::rate_limit::RateLimiter;
use crate::services::sampler::TemperatureSampleJob;
use crate::services::scheduler::{Scheduler, SchedulerStatus};
use crate::services::tokens::{AuthError, TokenManager};

#[derive(Debug)]
pub enum PipelineError {
    UnknownAccount(String),
    UnknownInstallation(String),
    RateLimited,
    Auth(AuthError),
    Client(ClientError),
    Store(StoreError),
    Credentials(CredentialError),
    Scheduler(String),
}

impl core::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PipelineError::UnknownAccount(id) => write!(f, "unknown account {}", id),
            PipelineError::UnknownInstallation(id) => write!(f, "unknown installation {}", id),
            PipelineError::RateLimited => write!(f, "rate limit reached, try again later"),
            PipelineError::Auth(e) => write!(f, "authentication failed: {}", e),
            PipelineError::Client(e) => write!(f, "{}", e),
            PipelineError::Store(e) => write!(f, "{}", e),
            PipelineError::Credentials(e) => write!(f, "{}", e),
            PipelineError::Scheduler(e) => write!(f, "scheduler error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<AuthError> for PipelineError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::RateLimited => PipelineError::RateLimited,
            e => PipelineError::Auth(e),
        }
    }
}

impl From<ClientError> for PipelineError {
    fn from(value: ClientError) -> Self {
        PipelineError::Client(value)
    }
}

impl From<StoreError> for PipelineError {
    fn from(value: StoreError) -> Self {
        PipelineError::Store(value)
    }
}

impl From<CredentialError> for PipelineError {
    fn from(value: CredentialError) -> Self {
        PipelineError::Credentials(value)
    }
}

impl From<FeatureError> for PipelineError {
    fn from(value: FeatureError) -> Self {
        match value {
            FeatureError::RateLimited => PipelineError::RateLimited,
            FeatureError::Auth(e) => e.into(),
            FeatureError::Client(e) => PipelineError::Client(e),
        }
    }
}

pub struct Context {
    pub config: Config,
    pub api: Arc<dyn VendorApi>,
    pub limiter: Arc<RateLimiter>,
    pub tokens: TokenManager,
    pub features: FeatureCache,
    pub store: Store,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Context {
    /// Opens the store (applying migrations) and wires the shared components.
    pub fn new(
        config: Config,
        api: Arc<dyn VendorApi>,
        credentials: Arc<dyn CredentialStore>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, StoreError> {
        let store = Store::open(&config.database_path)?;
        Ok(Context {
            tokens: TokenManager::new(api.clone(), limiter.clone()),
            features: FeatureCache::new(api.clone(), limiter.clone(), config.feature_cache_ttl),
            config,
            api,
            limiter,
            store,
            credentials,
        })
    }

    pub fn account(&self, account_id: &str) -> Result<Account, PipelineError> {
        self.credentials
            .load_accounts()?
            .find(account_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownAccount(account_id.to_string()))
    }
}

pub struct Pipeline {
    ctx: Arc<Context>,
    archive: Scheduler<EventArchiveJob>,
    sampler: Scheduler<TemperatureSampleJob>,
}

impl Pipeline {
    pub fn new(ctx: Context) -> Self {
        let ctx = Arc::new(ctx);
        Pipeline {
            archive: Scheduler::new(EventArchiveJob::new(ctx.clone())),
            sampler: Scheduler::new(TemperatureSampleJob::new(ctx.clone())),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Starts both schedulers. A cadence that fails to start is logged; the other still runs.
    pub fn start_all(&self) {
        if let Err(e) = self.archive.start() {
            error!("Archive: failed to start: {}", e);
        }
        if let Err(e) = self.sampler.start() {
            error!("Sampler: failed to start: {}", e);
        }
    }

    pub fn stop_all(&self) {
        self.archive.stop();
        self.sampler.stop();
    }

    /// On-demand event fetch for one installation, saved like a scheduled one.
    pub fn fetch_events(
        &self,
        account_id: &str,
        installation_id: &str,
        mode: SyncMode,
    ) -> Result<ArchiveOutcome, PipelineError> {
        let account = self.ctx.account(account_id)?;
        let token = self.ctx.tokens.ensure(&account)?;
        if token.installation(installation_id).is_none() {
            return Err(PipelineError::UnknownInstallation(installation_id.to_string()));
        }
        let settings = self.ctx.credentials.load_event_archive_settings()?;
        let outcome = archive_installation(
            &self.ctx,
            &account,
            &token,
            installation_id,
            settings.days_back,
            mode,
            Utc::now(),
        )
        .map_err(PipelineError::Scheduler)?;
        info!(
            "Archive: on-demand fetch for installation {} saved {} new event(s) ({})",
            installation_id, outcome.saved.inserted, outcome.stop
        );
        Ok(outcome)
    }

    /// Features of one device, served from the cache when younger than the default TTL.
    pub fn fetch_features_with_cache(&self, account_id: &str, device: &DeviceKey) -> Result<Arc<Features>, PipelineError> {
        let account = self.ctx.account(account_id)?;
        let token = self.ctx.tokens.ensure(&account)?;
        if token.installation(&device.installation_id).is_none() {
            return Err(PipelineError::UnknownInstallation(device.installation_id.clone()));
        }
        self.ctx.features.get(device, &token.access_token).map_err(|e| {
            if e.is_unauthorized() {
                warn!("Features: token for account {} rejected, re-authenticating next time", account.id);
                self.ctx.tokens.invalidate(&account.id);
            }
            PipelineError::from(e)
        })
    }

    /// Installation tree of an account, resolved at login.
    pub fn installations(&self, account_id: &str) -> Result<Vec<Installation>, PipelineError> {
        let account = self.ctx.account(account_id)?;
        Ok(self.ctx.tokens.ensure(&account)?.installations.clone())
    }

    pub fn execute_command(
        &self,
        account_id: &str,
        device: &DeviceKey,
        feature: &str,
        command: &str,
        params: &Value,
    ) -> Result<(), PipelineError> {
        execute_command(
            &self.ctx,
            &CommandRequest {
                account_id,
                device,
                feature,
                command,
                params,
            },
        )
    }

    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>, PipelineError> {
        Ok(self.ctx.store.query_events(filter)?)
    }

    pub fn query_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<TemperatureSnapshot>, PipelineError> {
        Ok(self.ctx.store.query_snapshots(filter)?)
    }

    pub fn event_stats(&self) -> Result<EventStats, PipelineError> {
        Ok(self.ctx.store.event_stats()?)
    }

    pub fn consumption(&self, filter: &SnapshotFilter, bucket: Bucket) -> Result<Vec<ConsumptionBucket>, PipelineError> {
        Ok(self
            .ctx
            .store
            .consumption(filter, bucket, self.ctx.config.default_sample_interval_min)?)
    }

    pub fn archive_status(&self) -> SchedulerStatus {
        self.archive.status()
    }

    pub fn sampler_status(&self) -> SchedulerStatus {
        self.sampler.status()
    }

    /// Calls used in the (10-minute, 24-hour) windows.
    pub fn rate_limit_usage(&self) -> (usize, usize) {
        self.ctx.limiter.usage()
    }

    /// Persists new archive settings and restarts the archive loop with them.
    pub fn set_event_archive_settings(&self, settings: &EventArchiveSettings) -> Result<bool, PipelineError> {
        self.ctx.credentials.save_event_archive_settings(settings)?;
        self.ctx.store.record_event_archive_settings(settings, Utc::now())?;
        info!(
            "Archive: settings changed (enabled={}, interval={}min, retention={}d, days_back={})",
            settings.enabled, settings.interval_minutes, settings.retention_days, settings.days_back
        );
        self.archive.restart().map_err(PipelineError::Scheduler)
    }

    /// Persists new sampling settings and restarts the sampler with them.
    pub fn set_temperature_log_settings(&self, settings: &TemperatureLogSettings) -> Result<bool, PipelineError> {
        self.ctx.credentials.save_temperature_log_settings(settings)?;
        self.ctx.store.record_temperature_log_settings(settings, Utc::now())?;
        info!(
            "Sampler: settings changed (enabled={}, interval={}min, retention={}d)",
            settings.enabled, settings.sample_interval_minutes, settings.retention_days
        );
        self.sampler.restart().map_err(PipelineError::Scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeApi, test_context};

    fn pipeline(api: &Arc<FakeApi>) -> (tempfile::TempDir, Pipeline) {
        let (dir, ctx) = test_context(api.clone(), RateLimiter::new(), &["a@example.com"]);
        let ctx = Arc::try_unwrap(ctx).ok().expect("context not shared yet");
        (dir, Pipeline::new(ctx))
    }

    #[test]
    fn on_demand_fetch_and_full_sync() {
        let api = Arc::new(FakeApi::with_fixtures());
        let (_dir, p) = pipeline(&api);

        let first = p.fetch_events("a@example.com", "2048761", SyncMode::Incremental).unwrap();
        assert_eq!(first.saved.inserted, 5);

        api.reset_counters();
        let full = p.fetch_events("a@example.com", "2048761", SyncMode::Full).unwrap();
        assert_eq!(api.event_page_calls(), 2);
        assert_eq!(full.saved.inserted, 0);
        assert_eq!(full.saved.ignored, 5);
        assert_eq!(p.event_stats().unwrap().total, 5);
    }

    #[test]
    fn unknown_account_and_installation() {
        let api = Arc::new(FakeApi::with_fixtures());
        let (_dir, p) = pipeline(&api);
        assert!(matches!(
            p.fetch_events("nobody@example.com", "2048761", SyncMode::Full),
            Err(PipelineError::UnknownAccount(_))
        ));
        assert!(matches!(
            p.fetch_events("a@example.com", "1", SyncMode::Full),
            Err(PipelineError::UnknownInstallation(_))
        ));
    }

    #[test]
    fn features_are_cached_across_calls() {
        let api = Arc::new(FakeApi::with_fixtures());
        let (_dir, p) = pipeline(&api);
        let device = DeviceKey::new("2048761", "7736172143542227", "0");
        p.fetch_features_with_cache("a@example.com", &device).unwrap();
        let f = p.fetch_features_with_cache("a@example.com", &device).unwrap();
        assert_eq!(api.feature_calls(), 1);
        assert_eq!(f.number("heating.sensors.temperature.outside", "value"), Some(4.7));
    }

    #[test]
    fn settings_setter_persists_and_restarts() {
        let api = Arc::new(FakeApi::with_fixtures());
        let (_dir, p) = pipeline(&api);
        let disabled = TemperatureLogSettings {
            enabled: false,
            ..Default::default()
        };
        assert!(!p.set_temperature_log_settings(&disabled).unwrap());
        assert!(!p.sampler_status().running);
        assert_eq!(p.context().credentials.load_temperature_log_settings().unwrap(), disabled);
        let recorded = p.context().store.recorded_temperature_log_settings().unwrap().unwrap();
        assert!(!recorded.enabled);

        let enabled = TemperatureLogSettings {
            sample_interval_minutes: 60,
            ..Default::default()
        };
        assert!(p.set_temperature_log_settings(&enabled).unwrap());
        let status = p.sampler_status();
        assert!(status.running);
        assert_eq!(status.interval_secs, 3600);
        p.stop_all();
        assert!(!p.sampler_status().running);
    }

    #[test]
    fn disabling_the_archive_keeps_it_stopped() {
        let api = Arc::new(FakeApi::with_fixtures());
        let (_dir, p) = pipeline(&api);
        let settings = EventArchiveSettings {
            enabled: false,
            days_back: 3,
            ..Default::default()
        };
        assert!(!p.set_event_archive_settings(&settings).unwrap());
        assert!(!p.archive_status().running);
        assert_eq!(p.context().credentials.load_event_archive_settings().unwrap(), settings);
        let recorded = p.context().store.recorded_event_archive_settings().unwrap().unwrap();
        assert_eq!(recorded.days_back, 3);
        assert!(!recorded.enabled);
    }

    #[test]
    fn rejected_token_on_feature_read_is_invalidated() {
        let api = Arc::new(FakeApi::with_fixtures());
        let (_dir, p) = pipeline(&api);
        let device = DeviceKey::new("2048761", "7736172143542227", "0");
        api.reject_tokens(true);
        assert!(p.fetch_features_with_cache("a@example.com", &device).is_err());
        assert!(p.context().tokens.cached("a@example.com").is_none());

        api.reject_tokens(false);
        p.fetch_features_with_cache("a@example.com", &device).unwrap();
        assert_eq!(api.authorize_calls(), 2);
    }
}
