//! Sliding-window limiter for calls against the IoT API.
//!
//! The vendor quota (120 calls per 10 minutes, 1450 per 24 hours) applies to the
//! API client as a whole, so one limiter is shared by every account.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const SHORT_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const LONG_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const SHORT_LIMIT: usize = 110;
pub const LONG_LIMIT: usize = 1400;

#[derive(Debug, Default)]
struct Windows {
    short: VecDeque<Instant>,
    long: VecDeque<Instant>,
}

fn purge(window: &mut VecDeque<Instant>, horizon: Duration, now: Instant) {
    // Entries are appended in time order, so expired ones sit at the front.
    while let Some(&oldest) = window.front() {
        if now.saturating_duration_since(oldest) >= horizon {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    short_limit: usize,
    long_limit: usize,
    windows: Mutex<Windows>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(SHORT_LIMIT, LONG_LIMIT)
    }

    pub fn with_limits(short_limit: usize, long_limit: usize) -> Self {
        RateLimiter {
            short_limit,
            long_limit,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn record_call(&self) {
        self.record_call_at(Instant::now());
    }

    pub fn record_call_at(&self, now: Instant) {
        let mut w = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        w.short.push_back(now);
        w.long.push_back(now);
    }

    pub fn can_call(&self) -> bool {
        self.can_call_at(Instant::now())
    }

    pub fn can_call_at(&self, now: Instant) -> bool {
        let mut w = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        purge(&mut w.short, SHORT_WINDOW, now);
        purge(&mut w.long, LONG_WINDOW, now);
        w.short.len() < self.short_limit && w.long.len() < self.long_limit
    }

    /// Checks both windows and records the call under one lock, so concurrent
    /// callers can never overshoot a limit together.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut w = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        purge(&mut w.short, SHORT_WINDOW, now);
        purge(&mut w.long, LONG_WINDOW, now);
        if w.short.len() >= self.short_limit || w.long.len() >= self.long_limit {
            return false;
        }
        w.short.push_back(now);
        w.long.push_back(now);
        true
    }

    /// Current (10-minute, 24-hour) window sizes.
    pub fn usage(&self) -> (usize, usize) {
        self.usage_at(Instant::now())
    }

    pub fn usage_at(&self, now: Instant) -> (usize, usize) {
        let mut w = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        purge(&mut w.short, SHORT_WINDOW, now);
        purge(&mut w.long, LONG_WINDOW, now);
        (w.short.len(), w.long.len())
    }
}
