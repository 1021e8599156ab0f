//! C2 — per-provider token-bucket rate limiter.
//!
//! Generalizes the teacher's sliding-window `RateLimitTracker` shape (a
//! `Mutex`-guarded map keyed by provider/account, limiters created lazily)
//! into the exact token-bucket algorithm this system specifies. No I/O: the
//! limiter is pure in-memory bookkeeping driven by caller-supplied
//! timestamps.

use crate::store::model::now_ms;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeResult {
    pub allowed: bool,
    pub remaining: f64,
    pub next_refill_at: i64,
    pub wait_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_rate: f64, // tokens per second
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            refill_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    config: BucketConfig,
    tokens: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    fn new(config: BucketConfig, now: i64) -> Self {
        Self {
            config,
            tokens: config.capacity,
            last_refill_ms: now,
        }
    }

    /// Advance `last_refill_ms` by exactly as many whole-token intervals as
    /// have elapsed, so fractional progress toward the next token survives
    /// across calls instead of being rounded away.
    fn refill(&mut self, now: i64) {
        if self.config.refill_rate <= 0.0 {
            return;
        }
        let elapsed_ms = now - self.last_refill_ms;
        if elapsed_ms <= 0 {
            return;
        }
        let tokens_added = (elapsed_ms as f64 * self.config.refill_rate / 1000.0).floor();
        if tokens_added > 0.0 {
            self.tokens = (self.tokens + tokens_added).min(self.config.capacity);
            self.last_refill_ms += (tokens_added * (1000.0 / self.config.refill_rate)) as i64;
        }
    }

    fn next_refill_at(&self) -> i64 {
        if self.config.refill_rate <= 0.0 {
            return i64::MAX;
        }
        self.last_refill_ms + (1000.0 / self.config.refill_rate) as i64
    }

    fn peek(&self, now: i64) -> TokenBucket {
        let mut copy = *self;
        copy.refill(now);
        copy
    }

    fn try_consume(&mut self, now: i64) -> ConsumeResult {
        self.refill(now);
        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        let next = self.next_refill_at();
        ConsumeResult {
            allowed,
            remaining: self.tokens,
            next_refill_at: next,
            wait_ms: if allowed { 0 } else { (next - now).max(0) },
        }
    }

    fn status(&self, now: i64) -> ConsumeResult {
        let peeked = self.peek(now);
        ConsumeResult {
            allowed: peeked.tokens >= 1.0,
            remaining: peeked.tokens,
            next_refill_at: peeked.next_refill_at(),
            wait_ms: 0,
        }
    }

    fn update_config(&mut self, capacity: Option<f64>, refill_rate: Option<f64>) {
        if let Some(c) = capacity {
            self.config.capacity = c;
            self.tokens = self.tokens.min(c);
        }
        if let Some(r) = refill_rate {
            self.config.refill_rate = r;
        }
    }

    fn reset(&mut self, now: i64) {
        self.tokens = self.config.capacity;
        self.last_refill_ms = now;
    }
}

/// Keeps one token bucket per provider, created lazily on first touch.
pub struct RateLimiterManager {
    limiters: Mutex<HashMap<String, TokenBucket>>,
    default_config: BucketConfig,
}

impl RateLimiterManager {
    pub fn new(default_config: BucketConfig) -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
            default_config,
        }
    }

    pub fn configure(&self, provider: &str, config: BucketConfig) {
        let mut limiters = self.limiters.lock().unwrap();
        limiters.insert(provider.to_string(), TokenBucket::new(config, now_ms()));
    }

    pub fn try_consume(&self, provider: &str) -> ConsumeResult {
        let now = now_ms();
        let mut limiters = self.limiters.lock().unwrap();
        let bucket = limiters
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(self.default_config, now));
        bucket.try_consume(now)
    }

    /// Preserves input order; each provider's bucket is independent so the
    /// outcome for one does not affect another.
    pub fn try_consume_many(&self, providers: &[String]) -> Vec<ConsumeResult> {
        providers.iter().map(|p| self.try_consume(p)).collect()
    }

    pub fn status(&self, provider: &str) -> ConsumeResult {
        let now = now_ms();
        let mut limiters = self.limiters.lock().unwrap();
        let bucket = limiters
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(self.default_config, now));
        bucket.status(now)
    }

    pub fn update_config(&self, provider: &str, capacity: Option<f64>, refill_rate: Option<f64>) {
        let now = now_ms();
        let mut limiters = self.limiters.lock().unwrap();
        let bucket = limiters
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(self.default_config, now));
        bucket.update_config(capacity, refill_rate);
    }

    pub fn reset(&self, provider: &str) {
        let now = now_ms();
        let mut limiters = self.limiters.lock().unwrap();
        let bucket = limiters
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(self.default_config, now));
        bucket.reset(now);
    }
}
