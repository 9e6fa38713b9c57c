//! Cursor-paginated retrieval of installations and event history.
//!
//! Every page costs one call against the shared [`RateLimiter`]; the limiter is
//! consulted before each request so a fetch can stop cleanly mid-listing.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use std::collections::HashSet;

use crate::client::{ClientError, EventWindow, VendorApi};
use crate::db::models::NewEvent;
use crate::db::store::StoreError;
use crate::models::account::Installation;
use crate::models::events::new_event_from_wire;
use crate::services::rate_limit::RateLimiter;

/// Hard ceiling on pages per listing.
pub const MAX_PAGES: usize = 100;

/// Lookup of already-archived event hashes.
pub trait SeenEvents {
    fn contains_event_hash(&self, hash: &str) -> Result<bool, StoreError>;
}

impl SeenEvents for HashSet<String> {
    fn contains_event_hash(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.contains(hash))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Stop at the first page containing an event that is already archived.
    Incremental,
    /// Walk every page regardless of what is archived.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Empty page or no next cursor.
    Exhausted,
    /// A page contained an already-archived event.
    KnownEvent,
    PageCeiling,
    RateLimited,
    /// A later page failed; items from earlier pages are kept.
    Interrupted(String),
}

impl core::fmt::Display for StopReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StopReason::Exhausted => write!(f, "exhausted"),
            StopReason::KnownEvent => write!(f, "reached archived history"),
            StopReason::PageCeiling => write!(f, "page ceiling ({} pages)", MAX_PAGES),
            StopReason::RateLimited => write!(f, "rate limited"),
            StopReason::Interrupted(e) => write!(f, "interrupted: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome<T> {
    pub items: Vec<T>,
    pub pages: usize,
    pub stop: StopReason,
}

/// Shared pagination driver. `fetch_page` returns the page's items and its next cursor.
fn paginate<T>(
    limiter: &RateLimiter,
    what: &str,
    mut fetch_page: impl FnMut(Option<&str>) -> Result<(Vec<T>, Option<String>, bool), ClientError>,
) -> Result<FetchOutcome<T>, ClientError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    let stop = loop {
        if pages >= MAX_PAGES {
            warn!("Fetch: {} hit the {}-page ceiling; remaining pages skipped", what, MAX_PAGES);
            break StopReason::PageCeiling;
        }
        if !limiter.try_acquire() {
            let (short, long) = limiter.usage();
            warn!(
                "Fetch: {} deferred after {} page(s), rate limit reached ({} / 10min, {} / 24h)",
                what, pages, short, long
            );
            break StopReason::RateLimited;
        }

        let (page_items, next, hit_known) = match fetch_page(cursor.as_deref()) {
            Ok(page) => page,
            Err(e) if pages == 0 => return Err(e),
            Err(e) => {
                warn!("Fetch: {} page {} failed: {}", what, pages + 1, e);
                break StopReason::Interrupted(e.to_string());
            }
        };
        pages += 1;
        debug!("Fetch: {} page {} returned {} new item(s)", what, pages, page_items.len());

        let empty = page_items.is_empty() && next.is_none();
        items.extend(page_items);
        if hit_known {
            break StopReason::KnownEvent;
        }
        if empty {
            break StopReason::Exhausted;
        }
        match next {
            Some(c) => cursor = Some(c),
            None => break StopReason::Exhausted,
        }
    };

    Ok(FetchOutcome { items, pages, stop })
}

/// Lists every installation (with gateways and devices) visible to the token.
pub fn fetch_installations(
    api: &dyn VendorApi,
    limiter: &RateLimiter,
    access_token: &str,
) -> Result<FetchOutcome<Installation>, ClientError> {
    paginate(limiter, "installations", |cursor| {
        let page = api.installations_page(access_token, cursor)?;
        let next = if page.data.is_empty() {
            None
        } else {
            page.next_cursor().map(str::to_string)
        };
        Ok((page.data.into_iter().map(Installation::from).collect(), next, false))
    })
}

#[derive(Debug, Clone, Copy)]
pub struct EventRequest<'a> {
    pub account_id: &'a str,
    pub installation_id: &'a str,
    pub access_token: &'a str,
    pub days_back: u32,
}

/// Fetches event history for one installation, newest first.
///
/// In [`SyncMode::Incremental`] the first page holding an already-archived event ends
/// the fetch; the new events on that page are still returned. Events repeated across
/// pages are returned once.
pub fn fetch_events(
    api: &dyn VendorApi,
    limiter: &RateLimiter,
    seen: &dyn SeenEvents,
    req: &EventRequest<'_>,
    mode: SyncMode,
    now: DateTime<Utc>,
) -> Result<FetchOutcome<NewEvent>, ClientError> {
    let window = EventWindow {
        start: now - Duration::days(i64::from(req.days_back.max(1))),
        end: now,
    };
    let mut batch_hashes: HashSet<String> = HashSet::new();
    let what = format!("events for installation {}", req.installation_id);

    paginate(limiter, &what, |cursor| {
        let page = api.events_page(req.access_token, req.installation_id, &window, cursor)?;
        if page.data.is_empty() {
            return Ok((Vec::new(), None, false));
        }
        let next = page.next_cursor().map(str::to_string);

        let mut fresh = Vec::with_capacity(page.data.len());
        let mut hit_known = false;
        for dto in &page.data {
            let Some(row) = new_event_from_wire(dto, req.account_id, req.installation_id, now) else {
                debug!("Fetch: skipping event without timestamp on installation {}", req.installation_id);
                continue;
            };
            if mode == SyncMode::Incremental {
                match seen.contains_event_hash(&row.hash) {
                    Ok(true) => {
                        hit_known = true;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Fetch: dedup lookup failed, treating event as new: {}", e),
                }
            }
            if batch_hashes.insert(row.hash.clone()) {
                fresh.push(row);
            }
        }
        Ok((fresh, next, hit_known))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;

    fn request() -> EventRequest<'static> {
        EventRequest {
            account_id: "a@example.com",
            installation_id: "2048761",
            access_token: "token",
            days_back: 7,
        }
    }

    #[test]
    fn incremental_fetch_stops_at_known_event() {
        let api = FakeApi::with_fixtures();
        let limiter = RateLimiter::new();
        let now = Utc::now();

        // Archive the second event of page one.
        let full = fetch_events(&api, &limiter, &HashSet::new(), &request(), SyncMode::Full, now).unwrap();
        let mut seen = HashSet::new();
        seen.insert(full.items[1].hash.clone());
        api.reset_counters();

        let outcome = fetch_events(&api, &limiter, &seen, &request(), SyncMode::Incremental, now).unwrap();
        assert_eq!(outcome.stop, StopReason::KnownEvent);
        assert_eq!(outcome.pages, 1);
        assert_eq!(api.event_page_calls(), 1);
        // Both new events from page one survive, the known one is dropped.
        assert_eq!(outcome.items.len(), 2);
        assert!(outcome.items.iter().all(|e| !seen.contains(&e.hash)));
    }

    #[test]
    fn full_sync_walks_every_page() {
        let api = FakeApi::with_fixtures();
        let limiter = RateLimiter::new();
        let now = Utc::now();

        let first = fetch_events(&api, &limiter, &HashSet::new(), &request(), SyncMode::Full, now).unwrap();
        let seen: HashSet<String> = first.items.iter().map(|e| e.hash.clone()).collect();
        api.reset_counters();

        let outcome = fetch_events(&api, &limiter, &seen, &request(), SyncMode::Full, now).unwrap();
        assert_eq!(outcome.stop, StopReason::Exhausted);
        assert_eq!(outcome.pages, 2);
        assert_eq!(api.event_page_calls(), 2);
        assert_eq!(outcome.items.len(), 5);
    }

    #[test]
    fn stops_when_rate_limit_is_exhausted() {
        let api = FakeApi::with_fixtures();
        let limiter = RateLimiter::with_limits(1, 100);
        let outcome =
            fetch_events(&api, &limiter, &HashSet::new(), &request(), SyncMode::Full, Utc::now()).unwrap();
        assert_eq!(outcome.stop, StopReason::RateLimited);
        assert_eq!(outcome.pages, 1);
        assert_eq!(outcome.items.len(), 3);
        assert_eq!(limiter.usage().0, 1);
    }

    #[test]
    fn page_ceiling_is_enforced() {
        let api = FakeApi::with_endless_events();
        let limiter = RateLimiter::with_limits(10_000, 10_000);
        let outcome =
            fetch_events(&api, &limiter, &HashSet::new(), &request(), SyncMode::Full, Utc::now()).unwrap();
        assert_eq!(outcome.stop, StopReason::PageCeiling);
        assert_eq!(outcome.pages, MAX_PAGES);
        assert_eq!(api.event_page_calls(), MAX_PAGES);
    }

    #[test]
    fn first_page_failure_is_an_error() {
        let api = FakeApi::default();
        api.fail_events(true);
        let limiter = RateLimiter::new();
        let res = fetch_events(&api, &limiter, &HashSet::new(), &request(), SyncMode::Full, Utc::now());
        assert!(res.is_err());
    }

    #[test]
    fn installations_are_normalized() {
        let api = FakeApi::with_fixtures();
        let limiter = RateLimiter::new();
        let outcome = fetch_installations(&api, &limiter, "token").unwrap();
        assert_eq!(outcome.stop, StopReason::Exhausted);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].id, "2048761");
        assert_eq!(outcome.items[0].gateways[0].devices[0].id, "0");
    }
}
