//! Slot counters: one request counter per fixed-length time bucket.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{trace, warn};

use super::store::CounterStore;

/// Largest integer an IEEE-754 double represents exactly; counters saturate here.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Identifies the bucket a slot counts for.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotId {
    /// Bucket start, a multiple of `duration_seconds` (Unix seconds)
    pub starting_time_seconds: f64,
    /// Bucket length in seconds
    pub duration_seconds: f64,
    /// Logical key the bucket belongs to
    pub key: String,
}

impl SlotId {
    /// Create a new slot id.
    pub fn new(starting_time_seconds: f64, duration_seconds: f64, key: impl Into<String>) -> Self {
        Self {
            starting_time_seconds,
            duration_seconds,
            key: key.into(),
        }
    }

    /// Key under which a slot provider caches this slot.
    pub fn index_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.starting_time_seconds, self.duration_seconds, self.key
        )
    }

    /// Time after which no sliding window can reference this bucket any more,
    /// plus one bucket length of margin.
    pub fn end_of_life(&self) -> f64 {
        self.starting_time_seconds + self.duration_seconds * 3.0
    }
}

/// A counter for one time bucket.
///
/// `value` is allowed to lag behind `increment`; the only guarantees are that
/// the counter never decreases and never exceeds [`MAX_SAFE_INTEGER`].
pub trait Slot: Send + Sync + fmt::Debug {
    /// The bucket this slot counts for.
    fn id(&self) -> &SlotId;

    /// Count one more request. Must not block the caller.
    fn increment(&self);

    /// Best currently known count.
    fn value(&self) -> u64;

    /// Bucket start (Unix seconds).
    fn starting_time_seconds(&self) -> f64 {
        self.id().starting_time_seconds
    }
}

/// Add one to `counter` unless it is saturated. Returns whether it changed.
fn saturating_bump(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            (v < MAX_SAFE_INTEGER).then_some(v + 1)
        })
        .is_ok()
}

/// A process-local slot.
///
/// Counts are not shared between processes, so this slot is only suitable
/// for single-instance deployments and tests.
#[derive(Debug)]
pub struct MemorySlot {
    id: SlotId,
    counter: AtomicU64,
}

impl MemorySlot {
    /// Create a slot starting at zero.
    pub fn new(id: SlotId) -> Self {
        Self {
            id,
            counter: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_value(id: SlotId, value: u64) -> Self {
        Self {
            id,
            counter: AtomicU64::new(value.min(MAX_SAFE_INTEGER)),
        }
    }
}

impl Slot for MemorySlot {
    fn id(&self) -> &SlotId {
        &self.id
    }

    fn increment(&self) {
        saturating_bump(&self.counter);
    }

    fn value(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// A slot whose count lives in a shared [`CounterStore`].
///
/// The local counter is a cache: it is bumped immediately on `increment` and
/// raised to the store's value whenever a store call returns one. Store calls
/// run as detached tasks on `runtime`; failures are logged and dropped.
pub struct StoreSlot<S: CounterStore> {
    id: SlotId,
    store_key: String,
    store: Arc<S>,
    runtime: Handle,
    counter: Arc<AtomicU64>,
    expiry_requested: Arc<AtomicBool>,
}

impl<S: CounterStore> StoreSlot<S> {
    /// Create the slot and start fetching its current value from the store.
    pub fn new(id: SlotId, prefix: &str, store: Arc<S>, runtime: Handle) -> Self {
        let store_key = format!("{}:{}:{}", prefix, id.key, id.starting_time_seconds);
        let slot = Self {
            id,
            store_key,
            store,
            runtime,
            counter: Arc::new(AtomicU64::new(0)),
            expiry_requested: Arc::new(AtomicBool::new(false)),
        };
        slot.refresh();
        slot
    }

    /// Key of this slot's counter in the store.
    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    fn refresh(&self) {
        let store = Arc::clone(&self.store);
        let counter = Arc::clone(&self.counter);
        let key = self.store_key.clone();

        self.runtime.spawn(async move {
            match store.get(&key).await {
                Ok(Some(value)) => {
                    counter.fetch_max(value.min(MAX_SAFE_INTEGER), Ordering::SeqCst);
                    trace!(key = %key, value, "Fetched slot value");
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to fetch slot value"),
            }
        });
    }
}

impl<S: CounterStore> Slot for StoreSlot<S> {
    fn id(&self) -> &SlotId {
        &self.id
    }

    fn increment(&self) {
        if !saturating_bump(&self.counter) {
            return;
        }

        let store = Arc::clone(&self.store);
        let counter = Arc::clone(&self.counter);
        let expiry_requested = Arc::clone(&self.expiry_requested);
        let key = self.store_key.clone();
        let expire_at = self.id.end_of_life();

        self.runtime.spawn(async move {
            match store.increment(&key).await {
                Ok(Some(value)) => {
                    counter.fetch_max(value.min(MAX_SAFE_INTEGER), Ordering::SeqCst);
                    if !expiry_requested.swap(true, Ordering::SeqCst) {
                        if let Err(e) = store.set_expire_at(&key, expire_at, true).await {
                            warn!(key = %key, error = %e, "Failed to set slot expiration");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to increment slot"),
            }
        });
    }

    fn value(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl<S: CounterStore> fmt::Debug for StoreSlot<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSlot")
            .field("id", &self.id)
            .field("store_key", &self.store_key)
            .field("value", &self.value())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{LimiterError, Result};
    use crate::ratelimit::store::MemoryCounterStore;
    use async_trait::async_trait;
    use std::time::Duration;

    /// A store whose every call fails.
    pub(crate) struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<u64>> {
            Err(LimiterError::Store("connection refused".to_string()))
        }

        async fn increment(&self, _key: &str) -> Result<Option<u64>> {
            Err(LimiterError::Store("connection refused".to_string()))
        }

        async fn set_expire_at(&self, _key: &str, _at: f64, _nx: bool) -> Result<()> {
            Err(LimiterError::Store("connection refused".to_string()))
        }
    }

    /// Let detached store tasks run to completion.
    pub(crate) async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_slot_id_keys() {
        let id = SlotId::new(120.0, 30.0, "1.2.3.4");
        assert_eq!(id.index_key(), "120:30:1.2.3.4");
        assert_eq!(id.end_of_life(), 210.0);
    }

    #[test]
    fn test_memory_slot_counts() {
        let slot = MemorySlot::new(SlotId::new(0.0, 10.0, "k"));
        assert_eq!(slot.value(), 0);

        let mut last = slot.value();
        for _ in 0..5 {
            slot.increment();
            assert!(slot.value() > last);
            last = slot.value();
        }
        assert_eq!(slot.value(), 5);
        assert_eq!(slot.starting_time_seconds(), 0.0);
    }

    #[test]
    fn test_memory_slot_saturates() {
        let slot = MemorySlot::with_value(SlotId::new(0.0, 10.0, "k"), MAX_SAFE_INTEGER - 1);
        slot.increment();
        assert_eq!(slot.value(), MAX_SAFE_INTEGER);
        slot.increment();
        assert_eq!(slot.value(), MAX_SAFE_INTEGER);
    }

    #[tokio::test]
    async fn test_store_slot_reads_existing_value() {
        let store = Arc::new(MemoryCounterStore::new());
        for _ in 0..4 {
            store.increment("rl:user:90").await.unwrap();
        }

        let slot = StoreSlot::new(
            SlotId::new(90.0, 30.0, "user"),
            "rl",
            Arc::clone(&store),
            Handle::current(),
        );
        assert_eq!(slot.store_key(), "rl:user:90");

        settle().await;
        assert_eq!(slot.value(), 4);
    }

    #[tokio::test]
    async fn test_store_slot_increments_remote_and_sets_expiry() {
        let store = Arc::new(MemoryCounterStore::new());
        let slot = StoreSlot::new(
            SlotId::new(90.0, 30.0, "user"),
            "rl",
            Arc::clone(&store),
            Handle::current(),
        );

        slot.increment();
        // Visible locally before the store answers.
        assert_eq!(slot.value(), 1);
        slot.increment();

        settle().await;
        assert_eq!(store.get("rl:user:90").await.unwrap(), Some(2));
        assert_eq!(store.expires_at("rl:user:90"), Some(180.0));
        assert_eq!(slot.value(), 2);
    }

    #[tokio::test]
    async fn test_store_slot_picks_up_other_writers() {
        let store = Arc::new(MemoryCounterStore::new());
        let slot = StoreSlot::new(
            SlotId::new(0.0, 60.0, "shared"),
            "rl",
            Arc::clone(&store),
            Handle::current(),
        );
        settle().await;

        // Another process counted three requests meanwhile.
        for _ in 0..3 {
            store.increment("rl:shared:0").await.unwrap();
        }
        slot.increment();
        settle().await;

        assert_eq!(slot.value(), 4);
    }

    #[tokio::test]
    async fn test_store_slot_swallows_failures() {
        let slot = StoreSlot::new(
            SlotId::new(0.0, 60.0, "k"),
            "rl",
            Arc::new(FailingStore),
            Handle::current(),
        );

        slot.increment();
        slot.increment();
        settle().await;

        assert_eq!(slot.value(), 2);
    }
}
