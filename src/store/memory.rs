//! In-process counter store.
//!
//! Backs every limiter in a single process with a [`DashMap`]. Each operation
//! holds the shard lock for its key for the whole read-modify-write, so the
//! bounded increment is atomic without a compensating step. Expiry is applied
//! lazily on access.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{Admission, SharedCounterStore};
use crate::error::{GateError, Result};

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: u64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Counter store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the coordination service going away (or coming back).
    ///
    /// While offline every operation fails with `StoreUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| !s.is_expired(now)).count()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.slots.get(key).is_some_and(|s| !s.is_expired(now))
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GateError::StoreUnavailable(
                "memory store is offline".to_string(),
            ));
        }
        Ok(())
    }

    /// Fetch the slot for `key`, replacing it if it has expired.
    fn live_entry(&self, key: &str) -> Entry<'_, String, Slot> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(now) => {
                trace!(key = %key, "Expired counter dropped");
                let (key, _) = occupied.remove_entry();
                self.slots.entry(key)
            }
            entry => entry,
        }
    }
}

#[async_trait]
impl SharedCounterStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        self.check_online()?;
        let mut slot = self.live_entry(key).or_insert(Slot {
            value: 0,
            expires_at: None,
        });
        slot.value += 1;
        Ok(slot.value)
    }

    async fn decrement(&self, key: &str) -> Result<u64> {
        self.check_online()?;
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) if occupied.get().value > 0 => {
                let slot = occupied.get_mut();
                slot.value -= 1;
                Ok(slot.value)
            }
            _ => Err(GateError::CounterUnderflow(key.to_string())),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|s| !s.is_expired(now))
            .map(|s| s.value))
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        self.check_online()?;
        if let Entry::Occupied(mut occupied) = self.live_entry(key) {
            occupied.get_mut().expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.check_online()?;
        self.slots.remove(key);
        Ok(())
    }

    async fn increment_within(
        &self,
        key: &str,
        limit: u64,
        ttl: Option<Duration>,
    ) -> Result<Admission> {
        self.check_online()?;
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if let Some(ttl) = ttl {
                    slot.expires_at = Some(Instant::now() + ttl);
                }
                if slot.value >= limit {
                    return Ok(Admission::Refused(slot.value));
                }
                slot.value += 1;
                Ok(Admission::Admitted(slot.value))
            }
            Entry::Vacant(vacant) => {
                if limit == 0 {
                    return Ok(Admission::Refused(0));
                }
                vacant.insert(Slot {
                    value: 1,
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                });
                Ok(Admission::Admitted(1))
            }
        }
    }
}
