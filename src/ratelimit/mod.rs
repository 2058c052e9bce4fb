//! Admission control against per-provider QPM and concurrency quotas.

mod limiter;
mod permit;
mod window;

pub use limiter::{worker_id, LimiterStats, RateLimiter, RateLimiterConfig, DEFAULT_KEY_PREFIX};
pub use permit::{Permit, Release};
pub use window::{FixedWindow, QpmLimit, WindowSlot};
