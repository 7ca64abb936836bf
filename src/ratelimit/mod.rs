//! Sliding window rate limiting logic and counter storage.

mod provider;
mod rate;
mod registry;
mod rule;
mod slot;
mod slot_provider;
mod store;
mod window;

pub use provider::SlidingWindowProvider;
pub use rate::{Rate, TimeUnit};
pub use registry::{build_slot_provider, RuleRegistry};
pub use rule::{Limited, RateLimitRule, RateLimitRuleBuilder, RuleOutcome};
pub use slot::{MemorySlot, Slot, SlotId, StoreSlot, MAX_SAFE_INTEGER};
pub use slot_provider::{MemorySlotProvider, SlotCache, SlotProvider, StoreSlotProvider};
pub use store::{CounterStore, MemoryCounterStore};
#[cfg(feature = "redis")]
pub use store::RedisCounterStore;
pub use window::{unix_now, Decision, SlidingWindow};
