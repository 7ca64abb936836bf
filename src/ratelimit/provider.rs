//! Per-key cache of sliding windows sharing one rate and slot provider.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::rate::Rate;
use super::slot_provider::{MemorySlotProvider, SlotProvider};
use super::window::{unix_now, Decision, SlidingWindow};
use crate::error::Result;

/// Lazily creates one [`SlidingWindow`] per logical key.
///
/// Windows are never evicted; each holds at most two slot references, but
/// the number of windows grows with the number of distinct keys seen.
pub struct SlidingWindowProvider {
    rate: Rate,
    slot_provider: Arc<dyn SlotProvider>,
    namespace: Option<String>,
    windows: DashMap<String, Arc<SlidingWindow>>,
}

impl SlidingWindowProvider {
    /// Create a provider whose windows share `slot_provider`.
    ///
    /// Fails if `rate` cannot back a sliding window.
    pub fn new(rate: Rate, slot_provider: Arc<dyn SlotProvider>) -> Result<Self> {
        rate.validate()?;
        Ok(Self {
            rate,
            slot_provider,
            namespace: None,
            windows: DashMap::new(),
        })
    }

    /// Count keys under `namespace` in the slot provider.
    ///
    /// Providers sharing one slot provider must use distinct namespaces, or
    /// equal keys with equal periods end up in the same slots.
    pub fn namespaced(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Namespace of this provider's slots, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Create a provider backed by process-local slots.
    pub fn in_memory(rate: Rate) -> Result<Self> {
        Self::new(rate, Arc::new(MemorySlotProvider::new()))
    }

    /// The window for `key`, created on first use.
    pub fn get(&self, key: &str) -> Arc<SlidingWindow> {
        if let Some(window) = self.windows.get(key) {
            return Arc::clone(&window);
        }

        let window = self.windows.entry(key.to_string()).or_insert_with(|| {
            let slot_key = match &self.namespace {
                Some(namespace) => format!("{}:{}", namespace, key),
                None => key.to_string(),
            };
            Arc::new(SlidingWindow::from_validated(
                self.rate,
                Arc::clone(&self.slot_provider),
                slot_key,
            ))
        });
        Arc::clone(&window)
    }

    /// Decide for `key` at `now` (Unix seconds).
    pub fn is_rate_limited(&self, key: &str, now: f64) -> Decision {
        self.get(key).is_rate_limited(now)
    }

    /// Decide for `key` at the current time.
    pub fn check(&self, key: &str) -> Decision {
        self.is_rate_limited(key, unix_now())
    }

    /// The rate shared by all windows.
    pub fn rate(&self) -> &Rate {
        &self.rate
    }

    /// The slot provider shared by all windows.
    pub fn slot_provider(&self) -> &Arc<dyn SlotProvider> {
        &self.slot_provider
    }

    /// Number of keys with a window.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no window has been created yet.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl fmt::Debug for SlidingWindowProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowProvider")
            .field("rate", &self.rate)
            .field("namespace", &self.namespace)
            .field("windows", &self.windows.len())
            .finish_non_exhaustive()
    }
}
