//! Per-principal request rate limiting.
//!
//! Sliding-window approximation with two buckets per key: the count for the
//! current fixed window and the count for the previous one. The admitted
//! estimate weighs the previous bucket by the fraction of the window that
//! still overlaps it, so bursts at a window boundary cannot double the
//! limit.
//!
//! A limit or window of zero disables limiting. Keys never contend with
//! each other: the map mutex is held only for the lookup-or-insert, each
//! counter has its own lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// A sliding-window request limiter keyed by principal.
#[derive(Debug)]
pub struct Limiter {
    request_limit: u32,
    request_window: Duration,
    counters: Mutex<HashMap<String, Arc<Mutex<Counter>>>>,
}

#[derive(Debug, Default)]
struct Counter {
    latest_window_from: Option<DateTime<Utc>>,
    latest_bucket: u32,
    previous_bucket: u32,
}

impl Limiter {
    /// Creates a limiter admitting `limit` requests per `window` per key.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            request_limit: limit,
            request_window: window,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Admits or rejects one request for `key`.
    ///
    /// # Errors
    ///
    /// [`Error::RateLimited`] carrying the retry-after hint when the
    /// approximated request count has reached the limit.
    pub fn allow(&self, key: &str) -> Result<()> {
        if self.request_limit == 0 || self.request_window.is_zero() {
            return Ok(());
        }
        let counter = self.counter(key);
        let mut counter = counter
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        counter.increment(self.request_window, self.request_limit)
    }

    fn counter(&self, key: &str) -> Arc<Mutex<Counter>> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(counters.entry(key.to_string()).or_default())
    }
}

impl Counter {
    fn increment(&mut self, window: Duration, limit: u32) -> Result<()> {
        let now = Utc::now();
        self.slide(window, now);
        let count = self.approximate(window, now);

        if count < limit {
            self.latest_bucket += 1;
            Ok(())
        } else {
            Err(Error::RateLimited {
                retry_after: window.as_secs_f64().ceil() as u64,
            })
        }
    }

    /// Rolls the buckets forward so that `latest_window_from` is the fixed
    /// window containing `now`.
    fn slide(&mut self, window: Duration, now: DateTime<Utc>) {
        let current_from = truncate(now, window);
        let latest_from = self.latest_window_from.unwrap_or(DateTime::UNIX_EPOCH);
        if current_from > latest_from {
            let prior_from = current_from
                - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
            self.previous_bucket = if prior_from > latest_from {
                0
            } else {
                self.latest_bucket
            };
            self.latest_window_from = Some(current_from);
            self.latest_bucket = 0;
        }
    }

    fn approximate(&self, window: Duration, now: DateTime<Utc>) -> u32 {
        let latest_from = self.latest_window_from.unwrap_or(DateTime::UNIX_EPOCH);
        let elapsed = (now - latest_from)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let remaining = (window.as_secs_f64() - elapsed).max(0.0);
        let fraction = remaining / window.as_secs_f64();
        (f64::from(self.previous_bucket) * fraction) as u32 + self.latest_bucket
    }
}

/// Truncates `t` down to a multiple of `window` since the epoch.
fn truncate(t: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
    let ms = t.timestamp_millis();
    DateTime::from_timestamp_millis(ms - ms.rem_euclid(window_ms)).unwrap_or(DateTime::UNIX_EPOCH)
}
