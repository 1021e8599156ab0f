//! Rolling quota counters consulted by `should_route` for providers that
//! advertise quota limits.
//!
//! Generalizes the teacher's `scheduler::rate_limits::SlidingWindow`
//! (a `VecDeque<(timestamp, weight)>` counter with O(1) weighted recording)
//! from a single requests-per-minute window into the daily/weekly/monthly
//! rolling windows plus a 24h view this system's quotas need. Timestamps are
//! millisecond epoch `i64` throughout, matching the rest of the crate
//! (the teacher uses `chrono::DateTime<Utc>`; this module swaps that for the
//! plain-epoch convention the store and rate limiter already use).

use crate::queue::QuotaStatus;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;
const MONTH_MS: i64 = 30 * DAY_MS;

pub struct SlidingWindow {
    window_ms: i64,
    max_count: u64,
    events: VecDeque<(i64, u64)>,
}

impl SlidingWindow {
    pub fn new(window_ms: i64, max_count: u64) -> Self {
        Self {
            window_ms,
            max_count,
            events: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: i64) {
        let cutoff = now - self.window_ms;
        while self.events.front().is_some_and(|(t, _)| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    pub fn record(&mut self, at: i64, weight: u64) {
        self.evict(at);
        self.events.push_back((at, weight));
    }

    pub fn count_in_window(&mut self, now: i64) -> u64 {
        self.evict(now);
        self.events.iter().map(|(_, w)| w).sum()
    }

    pub fn is_limited(&mut self, now: i64, max_count: u64) -> bool {
        self.count_in_window(now) >= max_count
    }

    pub fn time_until_reset(&mut self, now: i64) -> Option<i64> {
        if !self.is_limited(now, self.max_count) {
            return None;
        }
        self.events.front().map(|(ts, _)| (ts + self.window_ms) - now)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaLimits {
    pub daily: Option<u64>,
    pub weekly: Option<u64>,
    pub monthly: Option<u64>,
}

struct QuotaTracker {
    daily: SlidingWindow,
    weekly: SlidingWindow,
    monthly: SlidingWindow,
    limits: QuotaLimits,
}

impl QuotaTracker {
    fn new(limits: QuotaLimits) -> Self {
        Self {
            daily: SlidingWindow::new(DAY_MS, limits.daily.unwrap_or(u64::MAX)),
            weekly: SlidingWindow::new(WEEK_MS, limits.weekly.unwrap_or(u64::MAX)),
            monthly: SlidingWindow::new(MONTH_MS, limits.monthly.unwrap_or(u64::MAX)),
            limits,
        }
    }
}

/// Per-provider rolling quota counters. Providers with no registered limits
/// are simply absent from `status()`'s consideration — `None` means "no
/// quota ceiling applies here", per the routing contract.
pub struct QuotaManager {
    trackers: Mutex<HashMap<String, QuotaTracker>>,
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaManager {
    pub fn new() -> Self {
        Self {
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) the daily/weekly/monthly limits for a
    /// provider. A provider with no call to this method has no quota.
    pub fn configure(&self, provider: &str, limits: QuotaLimits) {
        self.trackers
            .lock()
            .unwrap()
            .insert(provider.to_string(), QuotaTracker::new(limits));
    }

    pub fn record(&self, provider: &str, now: i64, weight: u64) {
        let mut trackers = self.trackers.lock().unwrap();
        if let Some(t) = trackers.get_mut(provider) {
            t.daily.record(now, weight);
            t.weekly.record(now, weight);
            t.monthly.record(now, weight);
        }
    }

    /// `None` if the provider advertises no quota limits (not consulted by
    /// routing). `Some` otherwise, reporting the tightest window that is
    /// currently breached, if any.
    pub fn status(&self, provider: &str, now: i64) -> Option<QuotaStatus> {
        let mut trackers = self.trackers.lock().unwrap();
        let tracker = trackers.get_mut(provider)?;

        for (window, limit) in [
            (&mut tracker.daily, tracker.limits.daily),
            (&mut tracker.weekly, tracker.limits.weekly),
            (&mut tracker.monthly, tracker.limits.monthly),
        ] {
            if let Some(limit) = limit {
                if window.is_limited(now, limit) {
                    let retry_after_ms = window.time_until_reset(now).unwrap_or(0).max(0);
                    return Some(QuotaStatus {
                        within_limit: false,
                        retry_after_ms,
                    });
                }
            }
        }
        Some(QuotaStatus {
            within_limit: true,
            retry_after_ms: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_provider_has_no_quota_status() {
        let mgr = QuotaManager::new();
        assert!(mgr.status("anthropic", 0).is_none());
    }

    #[test]
    fn daily_limit_trips_after_threshold() {
        let mgr = QuotaManager::new();
        mgr.configure(
            "anthropic",
            QuotaLimits {
                daily: Some(2),
                weekly: None,
                monthly: None,
            },
        );
        mgr.record("anthropic", 0, 1);
        mgr.record("anthropic", 1, 1);
        let status = mgr.status("anthropic", 2).unwrap();
        assert!(!status.within_limit);
    }

    #[test]
    fn events_roll_off_outside_the_window() {
        let mgr = QuotaManager::new();
        mgr.configure(
            "anthropic",
            QuotaLimits {
                daily: Some(1),
                weekly: None,
                monthly: None,
            },
        );
        mgr.record("anthropic", 0, 1);
        assert!(!mgr.status("anthropic", 1).unwrap().within_limit);
        // Past the 24h window, the recorded event has rolled off.
        assert!(mgr.status("anthropic", DAY_MS + 1).unwrap().within_limit);
    }
}
