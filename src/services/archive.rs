//! Event archiving: fetch new history per installation and persist it.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::client::ClientError;
use crate::credentials::EventArchiveSettings;
use crate::db::store::SaveReport;
use crate::models::account::{Account, AccountToken};
use crate::pipeline::Context;
use crate::services::fetch::{EventRequest, StopReason, SyncMode, fetch_events};
use crate::services::scheduler::{CollectionJob, CycleReport};
use crate::services::tokens::AuthError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveOutcome {
    pub installation_id: String,
    pub pages: usize,
    pub fetched: usize,
    pub stop: String,
    pub rate_limited: bool,
    pub saved: SaveReport,
}

/// Fetches one installation's events and saves them. A 401 drops the account's
/// cached token so the next attempt logs in again.
pub fn archive_installation(
    ctx: &Context,
    account: &Account,
    token: &AccountToken,
    installation_id: &str,
    days_back: u32,
    mode: SyncMode,
    now: DateTime<Utc>,
) -> Result<ArchiveOutcome, String> {
    let req = EventRequest {
        account_id: &account.id,
        installation_id,
        access_token: &token.access_token,
        days_back,
    };
    let outcome = fetch_events(ctx.api.as_ref(), &ctx.limiter, &ctx.store, &req, mode, now).map_err(|e| {
        forget_rejected_token(ctx, account, &e);
        format!(
            "Archive: fetching events for installation {} (account {}) failed: {}",
            installation_id, account.id, e
        )
    })?;

    let saved = ctx
        .store
        .save_events(&outcome.items)
        .map_err(|e| format!("Archive: saving events for installation {} failed: {}", installation_id, e))?;

    debug!(
        "Archive: installation {} {} after {} page(s), {} new / {} known / {} failed",
        installation_id, outcome.stop, outcome.pages, saved.inserted, saved.ignored, saved.failed
    );
    Ok(ArchiveOutcome {
        installation_id: installation_id.to_string(),
        pages: outcome.pages,
        fetched: outcome.items.len(),
        rate_limited: outcome.stop == StopReason::RateLimited,
        stop: outcome.stop.to_string(),
        saved,
    })
}

fn forget_rejected_token(ctx: &Context, account: &Account, e: &ClientError) {
    if e.is_unauthorized() {
        warn!("Archive: token for account {} rejected, re-authenticating next time", account.id);
        ctx.tokens.invalidate(&account.id);
    }
}

pub struct EventArchiveJob {
    ctx: Arc<Context>,
}

impl EventArchiveJob {
    pub fn new(ctx: Arc<Context>) -> Self {
        EventArchiveJob { ctx }
    }
}

impl CollectionJob for EventArchiveJob {
    type Settings = EventArchiveSettings;

    fn name(&self) -> &'static str {
        "Archive"
    }

    fn load_settings(&self) -> Result<EventArchiveSettings, String> {
        self.ctx
            .credentials
            .load_event_archive_settings()
            .map_err(|e| format!("loading event archive settings failed: {}", e))
    }

    fn prepare(&self, settings: &EventArchiveSettings) -> Result<(), String> {
        self.ctx
            .store
            .record_event_archive_settings(settings, Utc::now())
            .map_err(|e| format!("recording event archive settings failed: {}", e))
    }

    fn run_cycle(&self, settings: &EventArchiveSettings) -> CycleReport {
        let ctx = &self.ctx;
        let now = Utc::now();
        let mut report = CycleReport::begin(now);

        let accounts = match ctx.credentials.load_accounts() {
            Ok(a) => a,
            Err(e) => {
                report.error(format!("Archive: loading accounts failed: {}", e));
                report.finished_at = Some(Utc::now());
                return report;
            }
        };

        'accounts: for account in accounts.active() {
            report.accounts += 1;
            let token = match ctx.tokens.ensure(account) {
                Ok(t) => t,
                Err(AuthError::RateLimited) => {
                    warn!("Archive: rate limit reached before account {}, deferring", account.id);
                    report.rate_limited = true;
                    break 'accounts;
                }
                Err(e) => {
                    report.error(format!("Archive: account {} skipped: {}", account.id, e));
                    continue;
                }
            };

            for installation in &token.installations {
                if !ctx.limiter.can_call() {
                    warn!(
                        "Archive: rate limit reached before installation {}, deferring rest of cycle",
                        installation.id
                    );
                    report.rate_limited = true;
                    break 'accounts;
                }
                report.installations += 1;
                match archive_installation(
                    ctx,
                    account,
                    &token,
                    &installation.id,
                    settings.days_back,
                    SyncMode::Incremental,
                    now,
                ) {
                    Ok(out) => {
                        report.fetched += out.fetched;
                        report.inserted += out.saved.inserted;
                        if out.rate_limited {
                            report.rate_limited = true;
                            break 'accounts;
                        }
                    }
                    Err(e) => report.error(e),
                }
            }
        }

        match ctx.store.cleanup_events(settings.retention_days, now) {
            Ok(n) => {
                if n > 0 {
                    info!("Archive: retention removed {} event(s) older than {} days", n, settings.retention_days);
                }
                report.deleted = n;
            }
            Err(e) => report.error(format!("Archive: retention cleanup failed: {}", e)),
        }

        report.finished_at = Some(Utc::now());
        report
    }
}
