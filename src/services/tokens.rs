//! Per-account token cache with single-flight re-authentication.
//!
//! `ensure()` serves a fresh cached token under a read lock. Otherwise it takes the
//! account's flight lock, re-checks the cache, and only then talks to the identity
//! provider. A new [`AccountToken`] (with its freshly listed installations) replaces
//! the old one in a single map insert.

use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::client::{ClientError, TokenGrant, VendorApi};
use crate::models::account::{Account, AccountToken};
use crate::services::fetch::{StopReason, fetch_installations};
use crate::services::rate_limit::RateLimiter;

#[derive(Debug)]
pub enum AuthError {
    /// Credentials were rejected. Retried on the next cycle.
    InvalidCredentials(String),
    /// Not enough rate-limit budget to list installations.
    RateLimited,
    Upstream(ClientError),
}

impl core::fmt::Display for AuthError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AuthError::InvalidCredentials(e) => write!(f, "invalid credentials: {}", e),
            AuthError::RateLimited => write!(f, "rate limit reached while listing installations"),
            AuthError::Upstream(e) => write!(f, "upstream error: {}", e),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClientError> for AuthError {
    fn from(value: ClientError) -> Self {
        if value.is_unauthorized() {
            AuthError::InvalidCredentials(value.to_string())
        } else {
            AuthError::Upstream(value)
        }
    }
}

pub struct TokenManager {
    api: Arc<dyn VendorApi>,
    limiter: Arc<RateLimiter>,
    tokens: RwLock<HashMap<String, Arc<AccountToken>>>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(api: Arc<dyn VendorApi>, limiter: Arc<RateLimiter>) -> Self {
        TokenManager {
            api,
            limiter,
            tokens: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Cached token for the account, fresh or not.
    pub fn cached(&self, account_id: &str) -> Option<Arc<AccountToken>> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account_id)
            .cloned()
    }

    fn cached_fresh(&self, account_id: &str) -> Option<Arc<AccountToken>> {
        self.cached(account_id).filter(|t| t.is_fresh())
    }

    /// Drops the cached token so the next `ensure()` re-authenticates.
    pub fn invalidate(&self, account_id: &str) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(account_id);
    }

    fn flight_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        flights.entry(account_id.to_string()).or_default().clone()
    }

    /// Returns a fresh token for the account, authenticating at most once per expiry.
    pub fn ensure(&self, account: &Account) -> Result<Arc<AccountToken>, AuthError> {
        if let Some(token) = self.cached_fresh(&account.id) {
            return Ok(token);
        }

        let flight = self.flight_lock(&account.id);
        let _guard = flight.lock().unwrap_or_else(PoisonError::into_inner);

        // Another caller may have finished while we waited.
        if let Some(token) = self.cached_fresh(&account.id) {
            return Ok(token);
        }

        let previous = self.cached(&account.id);
        let grant = self.obtain_grant(account, previous.as_deref())?;

        let listing = fetch_installations(self.api.as_ref(), &self.limiter, &grant.access_token)?;
        match &listing.stop {
            StopReason::RateLimited => return Err(AuthError::RateLimited),
            StopReason::Interrupted(e) => {
                return Err(AuthError::Upstream(ClientError::Transport(e.clone())));
            }
            _ => {}
        }

        let token = Arc::new(AccountToken {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
            installations: listing.items,
        });
        info!(
            "Tokens: account {} authenticated, {} installation(s), valid until {}",
            account.id,
            token.installations.len(),
            token.expires_at
        );
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.id.clone(), token.clone());
        Ok(token)
    }

    fn obtain_grant(&self, account: &Account, previous: Option<&AccountToken>) -> Result<TokenGrant, AuthError> {
        if let Some(refresh_token) = previous.and_then(|t| t.refresh_token.as_deref()) {
            match self.api.refresh(&account.credentials, refresh_token) {
                Ok(grant) => {
                    // Some grants omit the refresh token; keep using the old one.
                    let refresh_token = grant.refresh_token.or_else(|| Some(refresh_token.to_string()));
                    return Ok(TokenGrant { refresh_token, ..grant });
                }
                Err(e) => warn!(
                    "Tokens: refresh failed for account {}, falling back to full login: {}",
                    account.id, e
                ),
            }
        }
        self.api.authorize(&account.credentials).map_err(|e| {
            warn!("Tokens: login failed for account {}: {}", account.id, e);
            AuthError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeApi, test_account};
    use chrono::{Duration, Utc};
    use std::thread;

    fn manager(api: &Arc<FakeApi>) -> TokenManager {
        TokenManager::new(api.clone(), Arc::new(RateLimiter::new()))
    }

    #[test]
    fn second_ensure_uses_cache() {
        let api = Arc::new(FakeApi::with_fixtures());
        let tokens = manager(&api);
        let account = test_account("a@example.com");

        let first = tokens.ensure(&account).unwrap();
        let second = tokens.ensure(&account).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(api.authorize_calls(), 1);
        assert_eq!(first.installation_ids(), vec!["2048761"]);
    }

    #[test]
    fn concurrent_callers_authenticate_once() {
        let api = Arc::new(FakeApi::with_fixtures());
        api.set_auth_delay(std::time::Duration::from_millis(50));
        let tokens = Arc::new(manager(&api));
        let account = test_account("a@example.com");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tokens = tokens.clone();
                let account = account.clone();
                thread::spawn(move || tokens.ensure(&account).map(|t| t.access_token.clone()))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
        assert_eq!(api.authorize_calls(), 1);
    }

    #[test]
    fn accounts_do_not_share_tokens() {
        let api = Arc::new(FakeApi::with_fixtures());
        let tokens = manager(&api);
        tokens.ensure(&test_account("a@example.com")).unwrap();
        tokens.ensure(&test_account("b@example.com")).unwrap();
        assert_eq!(api.authorize_calls(), 2);
    }

    #[test]
    fn expired_token_is_refreshed_before_full_login() {
        let api = Arc::new(FakeApi::with_fixtures());
        api.set_token_lifetime(Duration::seconds(10));
        let tokens = manager(&api);
        let account = test_account("a@example.com");

        tokens.ensure(&account).unwrap();
        // Lifetime is inside the expiry margin, so the cached token is already stale.
        let refreshed = tokens.ensure(&account).unwrap();
        assert_eq!(api.authorize_calls(), 1);
        assert_eq!(api.refresh_calls(), 1);
        assert!(refreshed.refresh_token.is_some());
        assert!(refreshed.expires_at > Utc::now());
    }

    #[test]
    fn rejected_credentials_are_not_cached() {
        let api = Arc::new(FakeApi::with_fixtures());
        api.reject_credentials(true);
        let tokens = manager(&api);
        let account = test_account("a@example.com");

        let err = tokens.ensure(&account).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials(_)));
        assert!(tokens.cached(&account.id).is_none());

        api.reject_credentials(false);
        assert!(tokens.ensure(&account).is_ok());
        assert_eq!(api.authorize_calls(), 2);
    }

    #[test]
    fn exhausted_limiter_blocks_login() {
        let api = Arc::new(FakeApi::with_fixtures());
        let tokens = TokenManager::new(api.clone(), Arc::new(RateLimiter::with_limits(0, 0)));
        let err = tokens.ensure(&test_account("a@example.com")).unwrap_err();
        assert!(matches!(err, AuthError::RateLimited));
        assert_eq!(api.installation_page_calls(), 0);
    }
}
