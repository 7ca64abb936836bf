//! Named rate limiting rules loaded from configuration.
//!
//! Every rule in a registry gets its own [`SlidingWindowProvider`]; all of
//! them share the slot provider selected by the store configuration, each
//! counting its keys under the rule name.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::provider::SlidingWindowProvider;
use super::rate::Rate;
use super::slot_provider::{MemorySlotProvider, SlotProvider};
use super::window::{unix_now, Decision};
use crate::config::{LimiterConfig, StoreBackend, StoreConfig};
use crate::error::{LimiterError, Result};

/// Build the slot provider described by `store`.
///
/// The Redis backend needs the `redis` feature and a running tokio runtime.
pub fn build_slot_provider(store: &StoreConfig) -> Result<Arc<dyn SlotProvider>> {
    match store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemorySlotProvider::new())),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            use super::slot_provider::StoreSlotProvider;
            use super::store::RedisCounterStore;

            let redis = Arc::new(RedisCounterStore::new(&store.redis_url)?);
            Ok(Arc::new(StoreSlotProvider::new(redis, store.prefix.clone())?))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(LimiterError::Config(
            "the redis store backend requires the `redis` feature".to_string(),
        )),
    }
}

/// A set of named rules sharing one slot provider.
pub struct RuleRegistry {
    slot_provider: Arc<dyn SlotProvider>,
    rules: HashMap<String, SlidingWindowProvider>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new(slot_provider: Arc<dyn SlotProvider>) -> Self {
        Self {
            slot_provider,
            rules: HashMap::new(),
        }
    }

    /// Build a registry holding every rule of `config`.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        let mut registry = Self::new(build_slot_provider(&config.store)?);
        for rule in &config.rules {
            registry.register(&rule.name, rule.rate)?;
        }

        info!(
            backend = ?config.store.backend,
            rules = registry.rules.len(),
            "Rule registry initialized"
        );
        Ok(registry)
    }

    /// Add a rule.
    pub fn register(&mut self, name: &str, rate: Rate) -> Result<()> {
        if self.rules.contains_key(name) {
            return Err(LimiterError::Config(format!(
                "rule '{}' is defined more than once",
                name
            )));
        }

        let provider = SlidingWindowProvider::new(rate, Arc::clone(&self.slot_provider))
            .map_err(|e| match e {
                LimiterError::Config(msg) => {
                    LimiterError::Config(format!("rule '{}': {}", name, msg))
                }
                other => other,
            })?
            .namespaced(name);
        info!(rule = %name, rate = %rate, "Registered rate limit rule");
        self.rules.insert(name.to_string(), provider);
        Ok(())
    }

    /// The windows of rule `name`.
    pub fn get(&self, name: &str) -> Option<&SlidingWindowProvider> {
        self.rules.get(name)
    }

    /// Decide for `key` under rule `name` at `now` (Unix seconds).
    pub fn check_at(&self, name: &str, key: &str, now: f64) -> Result<Decision> {
        let rule = self
            .get(name)
            .ok_or_else(|| LimiterError::UnknownRule(name.to_string()))?;
        Ok(rule.is_rate_limited(key, now))
    }

    /// Decide for `key` under rule `name` at the current time.
    pub fn check(&self, name: &str, key: &str) -> Result<Decision> {
        self.check_at(name, key, unix_now())
    }

    /// Names of all rules, sorted.
    pub fn rule_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
