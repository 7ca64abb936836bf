//! Counter store trait for shared, network-backed slot counters.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// A key-value store holding integer counters.
///
/// Implementations are called from detached tasks; their errors are logged
/// by the caller and never reach the rate limiting decision.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Read the counter stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Atomically increment the counter under `key` and return the new value.
    async fn increment(&self, key: &str) -> Result<Option<u64>>;

    /// Expire `key` at the given Unix time (seconds).
    ///
    /// With `only_if_not_set`, an expiration already present on the key is
    /// left untouched.
    async fn set_expire_at(&self, key: &str, at_seconds: f64, only_if_not_set: bool)
        -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
struct StoredCounter {
    value: u64,
    expires_at: Option<f64>,
}

/// A process-local [`CounterStore`].
///
/// Expirations are recorded but only applied by [`purge_expired`](Self::purge_expired).
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, StoredCounter>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expiration recorded for `key`, if any.
    pub fn expires_at(&self, key: &str) -> Option<f64> {
        self.counters.get(key).and_then(|c| c.expires_at)
    }

    /// Drop every counter whose expiration is before `now`.
    pub fn purge_expired(&self, now: f64) -> usize {
        let mut purged = 0;
        self.counters.retain(|_, c| {
            let keep = c.expires_at.map_or(true, |at| at >= now);
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    /// Number of stored counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.counters.get(key).map(|c| c.value))
    }

    async fn increment(&self, key: &str) -> Result<Option<u64>> {
        let mut counter = self.counters.entry(key.to_string()).or_default();
        counter.value = counter.value.saturating_add(1);
        Ok(Some(counter.value))
    }

    async fn set_expire_at(
        &self,
        key: &str,
        at_seconds: f64,
        only_if_not_set: bool,
    ) -> Result<()> {
        if let Some(mut counter) = self.counters.get_mut(key) {
            if !(only_if_not_set && counter.expires_at.is_some()) {
                counter.expires_at = Some(at_seconds);
            }
        }
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisCounterStore;

#[cfg(feature = "redis")]
mod redis_store {
    use async_trait::async_trait;
    use redis::aio::MultiplexedConnection;
    use redis::AsyncCommands;
    use tokio::sync::OnceCell;

    use super::CounterStore;
    use crate::error::Result;

    /// A [`CounterStore`] backed by Redis `GET`, `INCR` and `EXPIREAT`.
    pub struct RedisCounterStore {
        client: redis::Client,
        connection: OnceCell<MultiplexedConnection>,
    }

    impl RedisCounterStore {
        /// Create a store for the given Redis URL.
        ///
        /// The connection is established on first use.
        pub fn new(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)?;
            Ok(Self {
                client,
                connection: OnceCell::new(),
            })
        }

        async fn connection(&self) -> Result<MultiplexedConnection> {
            let conn = self
                .connection
                .get_or_try_init(|| self.client.get_multiplexed_async_connection())
                .await?;
            Ok(conn.clone())
        }
    }

    #[async_trait]
    impl CounterStore for RedisCounterStore {
        async fn get(&self, key: &str) -> Result<Option<u64>> {
            let mut conn = self.connection().await?;
            let value: Option<u64> = conn.get(key).await?;
            Ok(value)
        }

        async fn increment(&self, key: &str) -> Result<Option<u64>> {
            let mut conn = self.connection().await?;
            let value: u64 = conn.incr(key, 1u64).await?;
            Ok(Some(value))
        }

        async fn set_expire_at(
            &self,
            key: &str,
            at_seconds: f64,
            only_if_not_set: bool,
        ) -> Result<()> {
            let mut conn = self.connection().await?;
            let mut cmd = redis::cmd("EXPIREAT");
            cmd.arg(key).arg(at_seconds.ceil() as i64);
            if only_if_not_set {
                // NX needs Redis 7.0 or later.
                cmd.arg("NX");
            }
            let _: i64 = cmd.query_async(&mut conn).await?;
            Ok(())
        }
    }
}
