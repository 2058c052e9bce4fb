//! Shared counter storage.
//!
//! Every piece of mutable state that must hold across worker processes lives
//! behind [`SharedCounterStore`]. Nothing above this module knows which
//! coordination service is in use.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Outcome of a bounded increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The increment was kept; carries the new value.
    Admitted(u64),
    /// The increment was undone; carries the value left in the store.
    Refused(u64),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn value(&self) -> u64 {
        match *self {
            Admission::Admitted(v) | Admission::Refused(v) => v,
        }
    }
}

/// Atomic counter operations against a store shared by all workers.
///
/// Implementations must fail with [`GateError::StoreUnavailable`] when the
/// backing service cannot be reached instead of returning a default.
///
/// [`GateError::StoreUnavailable`]: crate::error::GateError::StoreUnavailable
#[async_trait]
pub trait SharedCounterStore: Send + Sync {
    /// Short backend name reported in limiter stats.
    fn backend_name(&self) -> &'static str;

    /// Increment `key` by one, creating it at zero first. Returns the new value.
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Decrement `key` by one. A counter already at zero is left untouched and
    /// the call fails with `CounterUnderflow`.
    async fn decrement(&self, key: &str) -> Result<u64>;

    async fn get(&self, key: &str) -> Result<Option<u64>>;

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn reset(&self, key: &str) -> Result<()>;

    /// Increment `key` only if the result stays within `limit`.
    ///
    /// The default is the speculative form: increment, compare, and undo with a
    /// compensating decrement when over. `ttl` is applied on both outcomes so
    /// a key created by a refused increment still expires. Backends that can
    /// evaluate the whole step server-side should override it so the
    /// over-limit value is never observable.
    async fn increment_within(
        &self,
        key: &str,
        limit: u64,
        ttl: Option<Duration>,
    ) -> Result<Admission> {
        let value = self.increment(key).await?;
        let outcome = if value > limit {
            Admission::Refused(self.decrement(key).await?)
        } else {
            Admission::Admitted(value)
        };
        if let Some(ttl) = ttl {
            self.set_expiry(key, ttl).await?;
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for dyn SharedCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedCounterStore({})", self.backend_name())
    }
}

/// Open the store described by `config`.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn SharedCounterStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.url, config.op_timeout()).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GateError;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Store that only implements the primitives, to exercise the default
    /// `increment_within`.
    #[derive(Default)]
    struct PrimitiveStore {
        value: AtomicI64,
        expiries: AtomicI64,
    }

    #[async_trait]
    impl SharedCounterStore for PrimitiveStore {
        fn backend_name(&self) -> &'static str {
            "primitive"
        }

        async fn increment(&self, _key: &str) -> Result<u64> {
            Ok((self.value.fetch_add(1, Ordering::SeqCst) + 1) as u64)
        }

        async fn decrement(&self, key: &str) -> Result<u64> {
            let prev = self.value.fetch_sub(1, Ordering::SeqCst);
            if prev <= 0 {
                self.value.fetch_add(1, Ordering::SeqCst);
                return Err(GateError::CounterUnderflow(key.to_string()));
            }
            Ok((prev - 1) as u64)
        }

        async fn get(&self, _key: &str) -> Result<Option<u64>> {
            Ok(Some(self.value.load(Ordering::SeqCst) as u64))
        }

        async fn set_expiry(&self, _key: &str, _ttl: Duration) -> Result<()> {
            self.expiries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            self.value.store(0, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_increment_within_compensates() {
        let store = PrimitiveStore::default();

        assert_eq!(
            store.increment_within("k", 2, None).await.unwrap(),
            Admission::Admitted(1)
        );
        assert_eq!(
            store.increment_within("k", 2, None).await.unwrap(),
            Admission::Admitted(2)
        );
        // Third attempt is undone, leaving the counter at the limit.
        assert_eq!(
            store.increment_within("k", 2, None).await.unwrap(),
            Admission::Refused(2)
        );
        assert_eq!(store.get("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_zero_limit_never_admits() {
        let store = PrimitiveStore::default();
        let outcome = store.increment_within("k", 0, None).await.unwrap();
        assert!(!outcome.is_admitted());
        assert_eq!(outcome.value(), 0);
    }

    #[tokio::test]
    async fn test_refused_increment_still_sets_expiry() {
        let store = PrimitiveStore::default();
        let ttl = Some(Duration::from_secs(60));

        let outcome = store.increment_within("k", 0, ttl).await.unwrap();
        assert_eq!(outcome, Admission::Refused(0));
        // The refused increment created the key; it must not outlive the ttl.
        assert_eq!(store.expiries.load(Ordering::SeqCst), 1);

        store.increment_within("k", 1, ttl).await.unwrap();
        assert_eq!(store.expiries.load(Ordering::SeqCst), 2);
    }
}
