//! Slot providers: keyed caches of [`Slot`]s with time-based eviction.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::debug;

use super::slot::{MemorySlot, Slot, SlotId, StoreSlot};
use super::store::CounterStore;
use crate::error::{LimiterError, Result};

/// Cache of live slots, indexed by [`SlotId::index_key`].
///
/// At most one slot exists per index key. Slots past their
/// [`end_of_life`](SlotId::end_of_life) are evicted whenever a new slot is
/// created.
#[derive(Default)]
pub struct SlotCache {
    slots: Mutex<HashMap<String, Arc<dyn Slot>>>,
}

impl SlotCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached slot for `id`, or evict stale slots and cache the one
    /// built by `create`.
    pub fn get_or_create<F>(&self, id: SlotId, now: f64, create: F) -> Arc<dyn Slot>
    where
        F: FnOnce(SlotId) -> Arc<dyn Slot>,
    {
        let index_key = id.index_key();
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get(&index_key) {
            return Arc::clone(slot);
        }

        let before = slots.len();
        slots.retain(|_, slot| slot.id().end_of_life() >= now);
        let evicted = before - slots.len();
        if evicted > 0 {
            debug!(evicted, remaining = slots.len(), "Evicted stale slots");
        }

        debug!(slot = %index_key, "Creating slot");
        let slot = create(id);
        slots.insert(index_key, Arc::clone(&slot));
        slot
    }

    /// Number of cached slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Ids of all cached slots.
    pub fn ids(&self) -> Vec<SlotId> {
        self.slots.lock().values().map(|s| s.id().clone()).collect()
    }
}

impl fmt::Debug for SlotCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotCache")
            .field("len", &self.len())
            .finish()
    }
}

/// Factory and cache of slots.
///
/// Implementors only decide how a slot is built; caching and eviction come
/// from [`SlotCache`] through the provided [`get_or_create_slot`](Self::get_or_create_slot).
pub trait SlotProvider: Send + Sync {
    /// The cache backing this provider.
    fn cache(&self) -> &SlotCache;

    /// Build a new slot for `id`.
    fn create_slot(&self, id: SlotId) -> Arc<dyn Slot>;

    /// Return the slot for `id`, creating it if needed.
    fn get_or_create_slot(&self, id: SlotId, now: f64) -> Arc<dyn Slot> {
        self.cache()
            .get_or_create(id, now, |id| self.create_slot(id))
    }
}

/// Provider of process-local [`MemorySlot`]s.
#[derive(Debug, Default)]
pub struct MemorySlotProvider {
    cache: SlotCache,
}

impl MemorySlotProvider {
    /// Create a provider with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SlotProvider for MemorySlotProvider {
    fn cache(&self) -> &SlotCache {
        &self.cache
    }

    fn create_slot(&self, id: SlotId) -> Arc<dyn Slot> {
        Arc::new(MemorySlot::new(id))
    }
}

/// Provider of [`StoreSlot`]s sharing one [`CounterStore`].
pub struct StoreSlotProvider<S: CounterStore> {
    cache: SlotCache,
    store: Arc<S>,
    prefix: String,
    runtime: Handle,
}

impl<S: CounterStore> StoreSlotProvider<S> {
    /// Create a provider that runs store calls on the current tokio runtime.
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| LimiterError::NoRuntime)?;
        Ok(Self::with_runtime(store, prefix, runtime))
    }

    /// Create a provider that runs store calls on `runtime`.
    pub fn with_runtime(store: Arc<S>, prefix: impl Into<String>, runtime: Handle) -> Self {
        Self {
            cache: SlotCache::new(),
            store,
            prefix: prefix.into(),
            runtime,
        }
    }

    /// Prefix prepended to every store key.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl<S: CounterStore> SlotProvider for StoreSlotProvider<S> {
    fn cache(&self) -> &SlotCache {
        &self.cache
    }

    fn create_slot(&self, id: SlotId) -> Arc<dyn Slot> {
        Arc::new(StoreSlot::new(
            id,
            &self.prefix,
            Arc::clone(&self.store),
            self.runtime.clone(),
        ))
    }
}

impl<S: CounterStore> fmt::Debug for StoreSlotProvider<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSlotProvider")
            .field("cache", &self.cache)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
