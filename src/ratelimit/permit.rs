//! Scoped acquisition.
//!
//! A [`Permit`] owns one concurrency slot. The slot goes back to the store
//! from a task spawned on the runtime, whether the permit is released
//! explicitly with [`Permit::release`] or dropped (early return, panic, task
//! cancellation). The decrement therefore survives cancellation of the
//! caller.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::GateError;
use crate::store::SharedCounterStore;

/// Proof of admission through a [`RateLimiter`](super::RateLimiter).
#[must_use = "dropping a permit immediately releases its concurrency slot"]
pub struct Permit {
    slot: Option<HeldSlot>,
}

struct HeldSlot {
    store: Arc<dyn SharedCounterStore>,
    key: String,
    limiter: String,
}

impl HeldSlot {
    async fn release(self) {
        match self.store.decrement(&self.key).await {
            Ok(active) => {
                trace!(limiter = %self.limiter, active, "Released concurrency slot");
            }
            Err(GateError::CounterUnderflow(key)) => {
                warn!(
                    limiter = %self.limiter,
                    key = %key,
                    "Concurrency counter already at zero on release (was it cleared?)"
                );
            }
            Err(e) => {
                warn!(
                    limiter = %self.limiter,
                    error = %e,
                    "Failed to release concurrency slot; key expiry will reclaim it"
                );
            }
        }
    }

    fn spawn_release(self) -> Option<JoinHandle<()>> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(self.release())),
            Err(_) => {
                warn!(
                    limiter = %self.limiter,
                    "Permit released outside a runtime; key expiry will reclaim the slot"
                );
                None
            }
        }
    }
}

/// A release in flight. Awaiting it waits for the store to acknowledge;
/// dropping it does not cancel the release.
#[derive(Debug)]
pub struct Release {
    task: Option<JoinHandle<()>>,
}

impl Future for Release {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.get_mut().task.as_mut() {
            Some(task) => Pin::new(task).poll(cx).map(|_| ()),
            None => Poll::Ready(()),
        }
    }
}

impl Permit {
    /// Permit from a disabled limiter; holds nothing.
    pub(crate) fn passthrough() -> Self {
        Self { slot: None }
    }

    pub(crate) fn held(store: Arc<dyn SharedCounterStore>, key: String, limiter: String) -> Self {
        Self {
            slot: Some(HeldSlot {
                store,
                key,
                limiter,
            }),
        }
    }

    /// True when the limiter was disabled and no slot is held.
    pub fn is_passthrough(&self) -> bool {
        self.slot.is_none()
    }

    /// Give the concurrency slot back without suspending.
    ///
    /// The decrement is already running when this returns; await the result
    /// only to wait for it. Failures are logged, never returned: the caller's
    /// request has already finished.
    pub fn release(mut self) -> Release {
        Release {
            task: self.slot.take().and_then(HeldSlot::spawn_release),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.spawn_release();
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Some(slot) => f
                .debug_struct("Permit")
                .field("limiter", &slot.limiter)
                .field("key", &slot.key)
                .finish(),
            None => f.write_str("Permit(passthrough)"),
        }
    }
}
