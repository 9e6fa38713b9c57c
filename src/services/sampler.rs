//! Temperature sampling: one snapshot per heating device per tick.

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::TemperatureLogSettings;
use crate::pipeline::Context;
use crate::services::feature_cache::{DeviceKey, FeatureError};
use crate::services::scheduler::{CollectionJob, CycleReport};
use crate::services::snapshot::snapshot_from_features;
use crate::services::tokens::AuthError;

pub struct TemperatureSampleJob {
    ctx: Arc<Context>,
}

impl TemperatureSampleJob {
    pub fn new(ctx: Arc<Context>) -> Self {
        TemperatureSampleJob { ctx }
    }

    /// Cache lifetime used while sampling, short enough that every tick sees new data.
    fn sampling_ttl(&self, settings: &TemperatureLogSettings) -> Duration {
        self.ctx.features.default_ttl().min(settings.interval() / 2)
    }
}

impl CollectionJob for TemperatureSampleJob {
    type Settings = TemperatureLogSettings;

    fn name(&self) -> &'static str {
        "Sampler"
    }

    fn load_settings(&self) -> Result<TemperatureLogSettings, String> {
        self.ctx
            .credentials
            .load_temperature_log_settings()
            .map_err(|e| format!("loading temperature log settings failed: {}", e))
    }

    fn prepare(&self, settings: &TemperatureLogSettings) -> Result<(), String> {
        self.ctx
            .store
            .record_temperature_log_settings(settings, Utc::now())
            .map_err(|e| format!("recording temperature log settings failed: {}", e))
    }

    fn run_cycle(&self, settings: &TemperatureLogSettings) -> CycleReport {
        let ctx = &self.ctx;
        let now = Utc::now();
        let mut report = CycleReport::begin(now);
        let ttl = self.sampling_ttl(settings);
        let max_age = chrono::Duration::from_std(settings.interval()).unwrap_or(chrono::Duration::minutes(5));
        let interval_min = i32::try_from(settings.sample_interval_minutes.max(1)).unwrap_or(i32::MAX);

        let accounts = match ctx.credentials.load_accounts() {
            Ok(a) => a,
            Err(e) => {
                report.error(format!("Sampler: loading accounts failed: {}", e));
                report.finished_at = Some(Utc::now());
                return report;
            }
        };

        let mut rows = Vec::new();
        'accounts: for account in accounts.active() {
            report.accounts += 1;
            let token = match ctx.tokens.ensure(account) {
                Ok(t) => t,
                Err(AuthError::RateLimited) => {
                    report.rate_limited = true;
                    break 'accounts;
                }
                Err(e) => {
                    report.error(format!("Sampler: account {} skipped: {}", account.id, e));
                    continue;
                }
            };

            for installation in &token.installations {
                report.installations += 1;
                for gateway in &installation.gateways {
                    for device in gateway.devices.iter().filter(|d| d.is_heating()) {
                        let key = DeviceKey::new(&installation.id, &gateway.serial, &device.id);
                        let features = match ctx.features.get_with_ttl(&key, &token.access_token, ttl) {
                            Ok(f) => f,
                            Err(FeatureError::RateLimited) => {
                                warn!("Sampler: rate limit reached at {}, deferring rest of cycle", key);
                                report.rate_limited = true;
                                break 'accounts;
                            }
                            Err(e) if e.is_unauthorized() => {
                                ctx.tokens.invalidate(&account.id);
                                report.error(format!(
                                    "Sampler: token for account {} rejected at {}, re-authenticating next cycle: {}",
                                    account.id, key, e
                                ));
                                continue 'accounts;
                            }
                            Err(e) => {
                                report.error(format!("Sampler: features for {} unavailable: {}", key, e));
                                continue;
                            }
                        };
                        if now - features.fetched_at > max_age {
                            warn!("Sampler: only stale features for {}, skipping sample", key);
                            continue;
                        }
                        match snapshot_from_features(&features, &account.id, &key, now, interval_min) {
                            Some(row) => rows.push(row),
                            None => debug!("Sampler: {} reported no readings", key),
                        }
                    }
                }
            }
        }

        report.fetched = rows.len();
        match ctx.store.save_snapshots(&rows) {
            Ok(saved) => report.inserted = saved.inserted,
            Err(e) => report.error(format!("Sampler: saving {} snapshot(s) failed: {}", rows.len(), e)),
        }

        match ctx.store.cleanup_snapshots(settings.retention_days, now) {
            Ok(n) => {
                if n > 0 {
                    info!("Sampler: retention removed {} snapshot(s) older than {} days", n, settings.retention_days);
                }
                report.deleted = n;
            }
            Err(e) => report.error(format!("Sampler: retention cleanup failed: {}", e)),
        }

        report.finished_at = Some(Utc::now());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::SnapshotFilter;
    use crate::services::rate_limit::RateLimiter;
    use crate::testing::{FakeApi, test_context};

    #[test]
    fn samples_only_heating_devices() {
        let api = Arc::new(FakeApi::with_fixtures());
        let (_dir, ctx) = test_context(api.clone(), RateLimiter::new(), &["a@example.com"]);
        let report = TemperatureSampleJob::new(ctx.clone()).run_cycle(&TemperatureLogSettings::default());

        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.inserted, 1);
        assert_eq!(api.feature_calls(), 1);

        let rows = ctx.store.query_snapshots(&SnapshotFilter::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_id, "0");
        assert_eq!(rows[0].gateway_id, "7736172143542227");
        assert_eq!(rows[0].outside_temp_c, Some(4.7));
        assert_eq!(rows[0].sample_interval_min, Some(5));
    }

    #[test]
    fn sampling_ttl_is_capped_by_half_the_interval() {
        let api = Arc::new(FakeApi::with_fixtures());
        let (_dir, ctx) = test_context(api, RateLimiter::new(), &["a@example.com"]);
        let job = TemperatureSampleJob::new(ctx);
        let settings = TemperatureLogSettings {
            sample_interval_minutes: 2,
            ..Default::default()
        };
        assert_eq!(job.sampling_ttl(&settings), Duration::from_secs(60));
        let slow = TemperatureLogSettings {
            sample_interval_minutes: 60,
            ..Default::default()
        };
        assert_eq!(job.sampling_ttl(&slow), Duration::from_secs(300));
    }

    #[test]
    fn feature_failure_without_cache_is_reported() {
        let api = Arc::new(FakeApi::with_fixtures());
        api.fail_features(true);
        let (_dir, ctx) = test_context(api, RateLimiter::new(), &["a@example.com"]);
        let report = TemperatureSampleJob::new(ctx).run_cycle(&TemperatureLogSettings::default());
        assert_eq!(report.inserted, 0);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn rejected_token_is_dropped_and_renewed_next_cycle() {
        let api = Arc::new(FakeApi::with_fixtures());
        let (_dir, ctx) = test_context(api.clone(), RateLimiter::new(), &["a@example.com"]);
        let job = TemperatureSampleJob::new(ctx.clone());

        api.reject_tokens(true);
        let report = job.run_cycle(&TemperatureLogSettings::default());
        assert_eq!(report.inserted, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(ctx.tokens.cached("a@example.com").is_none());

        api.reject_tokens(false);
        let report = job.run_cycle(&TemperatureLogSettings::default());
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.inserted, 1);
        assert_eq!(api.authorize_calls(), 2);
    }
}
