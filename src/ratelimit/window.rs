//! Two-bucket sliding window rate limiting for a single logical key.
//!
//! The number of requests in the trailing period is estimated from the
//! counters of the current bucket and the one before it, the older bucket
//! weighted by the share of the period that has not yet elapsed in the
//! current bucket:
//!
//! ```text
//! requests = current + old * (period - (now - current_start)) / period
//! ```
//!
//! Once a key is rate limited, the time at which the estimate drops below
//! the limit again is computed and cached, so that blocked callers are
//! rejected without reading any counter until then.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use super::rate::Rate;
use super::slot::{Slot, SlotId};
use super::slot_provider::SlotProvider;
use crate::error::Result;

/// Current wall-clock time in Unix seconds, with microsecond precision.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Outcome of a rate limiting check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum Decision {
    /// The request is within the rate and has been counted.
    Allowed,
    /// The request exceeds the rate and has not been counted.
    RateLimited {
        /// Unix time (seconds) up to which the key is predicted to stay blocked
        until: f64,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Whether the request was rejected.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Decision::RateLimited { .. })
    }
}

#[derive(Default)]
struct WindowState {
    /// Most recent slots first; at most two are kept.
    slots: Vec<Arc<dyn Slot>>,
    rate_limited_until: Option<f64>,
}

/// Sliding window state for one logical key.
pub struct SlidingWindow {
    rate: Rate,
    slot_provider: Arc<dyn SlotProvider>,
    key: String,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    /// Create a window for `key`.
    ///
    /// Fails if the rate's period is shorter than one second or its request
    /// count is negative.
    pub fn new(
        rate: Rate,
        slot_provider: Arc<dyn SlotProvider>,
        key: impl Into<String>,
    ) -> Result<Self> {
        rate.validate()?;
        Ok(Self::from_validated(rate, slot_provider, key.into()))
    }

    /// Create a window from a rate that already passed [`Rate::validate`].
    pub(crate) fn from_validated(
        rate: Rate,
        slot_provider: Arc<dyn SlotProvider>,
        key: String,
    ) -> Self {
        debug!(key = %key, rate = %rate, "Creating sliding window");
        Self {
            rate,
            slot_provider,
            key,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// The logical key this window limits.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The rate this window enforces.
    pub fn rate(&self) -> &Rate {
        &self.rate
    }

    /// Cached time up to which this key is known to be rate limited.
    pub fn rate_limited_until(&self) -> Option<f64> {
        self.state.lock().rate_limited_until
    }

    /// Decide whether a request at the current time is allowed.
    pub fn check(&self) -> Decision {
        self.is_rate_limited(unix_now())
    }

    /// Decide whether a request at `now` (Unix seconds) is allowed.
    ///
    /// Allowed requests are counted in the current bucket; rejected ones are
    /// not counted.
    pub fn is_rate_limited(&self, now: f64) -> Decision {
        let mut state = self.state.lock();

        if let Some(until) = state.rate_limited_until {
            if now <= until {
                trace!(key = %self.key, now, until, "Still rate limited");
                return Decision::RateLimited { until };
            }
        }
        state.rate_limited_until = None;

        let period = self.rate.period_in_seconds();
        let actual_start = now - now.rem_euclid(period);
        let old_start = actual_start - period;

        let current_slot = self.slot(&mut state, actual_start, now);
        let old_slot = self.slot(&mut state, old_start, now);

        state.slots.sort_by(|a, b| {
            b.starting_time_seconds()
                .total_cmp(&a.starting_time_seconds())
        });
        state.slots.truncate(2);

        let old_value = old_slot.value() as f64;
        let current_value = current_slot.value() as f64;
        let elapsed = now - current_slot.starting_time_seconds();
        let requests = current_value + old_value * (period - elapsed) / period;

        trace!(
            key = %self.key,
            now,
            current = current_value,
            old = old_value,
            estimate = requests,
            limit = self.rate.requests,
            "Checking sliding window"
        );

        if requests < self.rate.requests {
            current_slot.increment();
            return Decision::Allowed;
        }

        let until = if old_value == 0.0 {
            current_slot.starting_time_seconds() + period
        } else {
            period + current_slot.starting_time_seconds()
                - ((self.rate.requests - current_value) * period) / old_value
        };
        state.rate_limited_until = Some(until);

        debug!(key = %self.key, now, until, "Rate limited");
        Decision::RateLimited { until }
    }

    /// Slot starting at `start`, from this window's own cache or the provider.
    fn slot(&self, state: &mut WindowState, start: f64, now: f64) -> Arc<dyn Slot> {
        if let Some(slot) = state
            .slots
            .iter()
            .find(|s| s.starting_time_seconds() == start)
        {
            return Arc::clone(slot);
        }

        let slot = self.slot_provider.get_or_create_slot(
            SlotId::new(start, self.rate.period_in_seconds(), self.key.as_str()),
            now,
        );
        state.slots.push(Arc::clone(&slot));
        slot
    }

    #[cfg(test)]
    fn cached_slot_starts(&self) -> Vec<f64> {
        self.state
            .lock()
            .slots
            .iter()
            .map(|s| s.starting_time_seconds())
            .collect()
    }
}

impl fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("key", &self.key)
            .field("rate", &self.rate)
            .field("rate_limited_until", &self.rate_limited_until())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimiterError;
    use crate::ratelimit::rate::TimeUnit;
    use crate::ratelimit::slot::tests::{settle, FailingStore};
    use crate::ratelimit::slot_provider::{MemorySlotProvider, StoreSlotProvider};
    use crate::ratelimit::store::{CounterStore, MemoryCounterStore};

    fn window(requests: f64, period_secs: f64) -> SlidingWindow {
        SlidingWindow::new(
            Rate::new(requests, period_secs, TimeUnit::Seconds),
            Arc::new(MemorySlotProvider::new()),
            "1.2.3.4",
        )
        .unwrap()
    }

    fn allowed_count(w: &SlidingWindow, now: f64, attempts: usize) -> usize {
        (0..attempts)
            .filter(|_| w.is_rate_limited(now).is_allowed())
            .count()
    }

    #[test]
    fn test_zero_requests_always_limited() {
        let w = window(0.0, 10.0);
        for now in [0.0, 5.5, 10.0, 11.0, 100.0, 1000.25] {
            assert!(w.is_rate_limited(now).is_rate_limited(), "now = {}", now);
        }
    }

    #[test]
    fn test_invalid_construction() {
        let provider: Arc<dyn SlotProvider> = Arc::new(MemorySlotProvider::new());

        let short = Rate::new(10.0, 0.5, TimeUnit::Seconds);
        assert!(matches!(
            SlidingWindow::new(short, Arc::clone(&provider), "k"),
            Err(LimiterError::Config(_))
        ));

        let negative = Rate::new(-1.0, 30.0, TimeUnit::Seconds);
        assert!(matches!(
            SlidingWindow::new(negative, provider, "k"),
            Err(LimiterError::Config(_))
        ));
    }

    #[test]
    fn test_limit_within_first_bucket() {
        let w = window(10.0, 30.0);

        for i in 0..10 {
            assert_eq!(w.is_rate_limited(100.0), Decision::Allowed, "call {}", i);
        }
        assert_eq!(w.is_rate_limited(100.0), Decision::RateLimited { until: 120.0 });
        assert_eq!(w.is_rate_limited(100.0), Decision::RateLimited { until: 120.0 });
    }

    #[test]
    fn test_old_bucket_decays_across_boundary() {
        let w = window(10.0, 30.0);
        assert_eq!(allowed_count(&w, 100.0, 12), 10);

        // The boundary itself is still covered by the cached prediction.
        assert!(w.is_rate_limited(120.0).is_rate_limited());

        // 10 * 29/30 = 9.67 leaves room for exactly one more request.
        assert!(w.is_rate_limited(121.0).is_allowed());
        let decision = w.is_rate_limited(121.0);
        match decision {
            Decision::RateLimited { until } => assert!((until - 123.0).abs() < 1e-9),
            Decision::Allowed => panic!("expected rate limited at 121"),
        }

        assert!(w.is_rate_limited(122.9).is_rate_limited());
        assert!(w.is_rate_limited(123.01).is_allowed());
    }

    #[test]
    fn test_fresh_bucket_allows_full_rate_again() {
        let w = window(10.0, 30.0);
        assert_eq!(allowed_count(&w, 100.0, 12), 10);
        assert_eq!(allowed_count(&w, 121.0, 2), 1);
        assert!(w.is_rate_limited(123.01).is_allowed());

        // At 150 the bucket [120, 150) holding 2 is still fully weighted.
        assert_eq!(allowed_count(&w, 150.0, 10), 8);

        // Both buckets before [240, 270) are empty.
        assert_eq!(allowed_count(&w, 240.0, 15), 10);
        assert!(w.is_rate_limited(240.0).is_rate_limited());
    }

    #[test]
    fn test_old_bucket_weighted_at_boundary() {
        let w = window(10.0, 30.0);
        assert_eq!(allowed_count(&w, 110.0, 4), 4);

        // At 150 the bucket [120, 150) is fully weighted; [90, 120) is gone.
        assert_eq!(allowed_count(&w, 150.0, 10), 10);
        // At 120 the bucket [90, 120) holding 4 is fully weighted.
        let w = window(10.0, 30.0);
        assert_eq!(allowed_count(&w, 110.0, 4), 4);
        assert_eq!(allowed_count(&w, 120.0, 10), 6);
    }

    #[test]
    fn test_limited_calls_are_not_counted() {
        let w = window(2.0, 10.0);
        assert_eq!(allowed_count(&w, 5.0, 50), 2);

        // Rejections did not inflate the old bucket: at 15, 2 * 5/10 = 1.
        assert_eq!(allowed_count(&w, 15.0, 5), 1);
    }

    #[test]
    fn test_fractional_times() {
        let w = window(3.0, 1.0);
        assert_eq!(allowed_count(&w, 0.25, 5), 3);
        assert_eq!(w.rate_limited_until(), Some(1.0));
        assert!(w.is_rate_limited(0.999).is_rate_limited());
        // 3 * (1 - 0.5) = 1.5 leaves room for two more.
        assert_eq!(allowed_count(&w, 1.5, 4), 2);
    }

    #[test]
    fn test_window_keeps_two_slots() {
        let w = window(100.0, 10.0);
        for now in [1.0, 11.0, 21.0, 31.0, 41.0] {
            w.is_rate_limited(now);
            assert!(w.cached_slot_starts().len() <= 2);
        }
        assert_eq!(w.cached_slot_starts(), vec![40.0, 30.0]);
    }

    #[test]
    fn test_keys_are_independent() {
        let provider: Arc<dyn SlotProvider> = Arc::new(MemorySlotProvider::new());
        let rate = Rate::new(1.0, 60.0, TimeUnit::Seconds);
        let a = SlidingWindow::new(rate, Arc::clone(&provider), "a").unwrap();
        let b = SlidingWindow::new(rate, provider, "b").unwrap();

        assert!(a.is_rate_limited(10.0).is_allowed());
        assert!(a.is_rate_limited(10.0).is_rate_limited());
        assert!(b.is_rate_limited(10.0).is_allowed());
    }

    #[test]
    fn test_check_uses_wall_clock() {
        let w = window(1.0, 3600.0);
        assert!(w.check().is_allowed());
        match w.check() {
            Decision::RateLimited { until } => assert!(until > unix_now()),
            Decision::Allowed => panic!("second call within an hour must be limited"),
        }
    }

    #[test]
    fn test_decision_serializes_with_tag() {
        let json = serde_json::to_value(Decision::RateLimited { until: 120.0 }).unwrap();
        assert_eq!(json["decision"], "rate-limited");
        assert_eq!(json["until"], 120.0);
        let json = serde_json::to_value(Decision::Allowed).unwrap();
        assert_eq!(json["decision"], "allowed");
    }

    #[tokio::test]
    async fn test_store_backed_window_sees_shared_counts() {
        let store = Arc::new(MemoryCounterStore::new());
        let rate = Rate::new(5.0, 60.0, TimeUnit::Seconds);

        let first = SlidingWindow::new(
            rate,
            Arc::new(StoreSlotProvider::new(Arc::clone(&store), "rl").unwrap()),
            "user",
        )
        .unwrap();
        assert_eq!(allowed_count(&first, 61.0, 3), 3);
        settle().await;
        assert_eq!(store.get("rl:user:60").await.unwrap(), Some(3));

        // A second process with its own provider over the same store.
        let second = SlidingWindow::new(
            rate,
            Arc::new(StoreSlotProvider::new(Arc::clone(&store), "rl").unwrap()),
            "user",
        )
        .unwrap();
        // Decided before the store answers, so admitted on a stale zero.
        assert!(second.is_rate_limited(62.0).is_allowed());
        settle().await;
        assert_eq!(allowed_count(&second, 62.0, 5), 1);
        settle().await;
        assert_eq!(store.get("rl:user:60").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_store_failures_do_not_block_decisions() {
        let w = SlidingWindow::new(
            Rate::new(2.0, 60.0, TimeUnit::Seconds),
            Arc::new(StoreSlotProvider::new(Arc::new(FailingStore), "rl").unwrap()),
            "k",
        )
        .unwrap();

        assert_eq!(allowed_count(&w, 10.0, 4), 2);
        settle().await;
        assert!(w.is_rate_limited(10.0).is_rate_limited());
    }
}
