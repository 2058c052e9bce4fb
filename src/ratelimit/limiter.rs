//! Cross-process QPM and concurrency limiter.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::permit::Permit;
use super::window::{FixedWindow, QpmLimit};
use crate::error::{GateError, Result};
use crate::provider::{ProviderEndpoint, ProviderRegistry};
use crate::store::SharedCounterStore;

pub const DEFAULT_KEY_PREFIX: &str = "llmgate:";
const DEFAULT_CONCURRENCY_TTL: Duration = Duration::from_secs(300);
const DEFAULT_CONCURRENCY_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_JITTER: Duration = Duration::from_millis(250);

/// Limits for one provider (or provider endpoint).
///
/// Processes that build equal configs end up on the same store keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub provider: String,
    pub endpoint: Option<String>,
    pub qpm_limit: QpmLimit,
    pub concurrent_limit: u64,
    pub enabled: bool,
    /// Length of one QPM accounting window.
    pub window: Duration,
    /// Safety-net expiry on the concurrency key, refreshed on every admission.
    pub concurrency_ttl: Duration,
    /// Default wait bound for [`RateLimiter::acquire`]; `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    /// Pause between attempts while all concurrency slots are taken.
    pub concurrency_backoff: Duration,
    /// Upper bound of the random delay added to every wait.
    pub jitter: Duration,
    pub key_prefix: String,
}

impl RateLimiterConfig {
    pub fn new(provider: &str, qpm_limit: u64, concurrent_limit: u64) -> Self {
        Self {
            provider: provider.to_string(),
            endpoint: None,
            qpm_limit: QpmLimit::Limited(qpm_limit),
            concurrent_limit,
            enabled: true,
            window: FixedWindow::MINUTE.length(),
            concurrency_ttl: DEFAULT_CONCURRENCY_TTL,
            acquire_timeout: None,
            concurrency_backoff: DEFAULT_CONCURRENCY_BACKOFF,
            jitter: DEFAULT_JITTER,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_qpm_limit(mut self, qpm_limit: QpmLimit) -> Self {
        self.qpm_limit = qpm_limit;
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, concurrency_backoff: Duration, jitter: Duration) -> Self {
        self.concurrency_backoff = concurrency_backoff;
        self.jitter = jitter;
        self
    }

    pub fn with_concurrency_ttl(mut self, ttl: Duration) -> Self {
        self.concurrency_ttl = ttl;
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub enabled: bool,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub qpm_limit: QpmLimit,
    pub concurrent_limit: u64,
    pub current_qpm: u64,
    pub active_requests: u64,
    pub qpm_key: String,
    pub concurrent_key: String,
    pub storage: String,
    pub worker_id: String,
    pub total_requests: u64,
    pub total_waits: u64,
    pub total_wait_ms: u64,
    pub avg_wait_ms: f64,
}

/// Per-process counters; never shared and only used for stats.
#[derive(Debug, Default)]
struct LocalCounters {
    total_requests: AtomicU64,
    total_waits: AtomicU64,
    total_wait_ms: AtomicU64,
}

/// Identity of this process in stats output.
pub fn worker_id() -> &'static str {
    static WORKER_ID: OnceLock<String> = OnceLock::new();
    WORKER_ID.get_or_init(|| {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", std::process::id(), &nonce[..8])
    })
}

/// Enforces a QPM ceiling and a concurrency ceiling for one provider, with
/// both counters held in a [`SharedCounterStore`].
pub struct RateLimiter {
    config: RateLimiterConfig,
    target: ProviderEndpoint,
    window: FixedWindow,
    store: Arc<dyn SharedCounterStore>,
    concurrent_key: String,
    qpm_key_base: String,
    counters: LocalCounters,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("target", &self.target)
            .field("config", &self.config)
            .field("storage", &self.store.backend_name())
            .finish()
    }
}

impl RateLimiter {
    /// Build a limiter, validating the provider against the built-in registry.
    pub fn new(config: RateLimiterConfig, store: Arc<dyn SharedCounterStore>) -> Result<Self> {
        Self::with_registry(config, store, &ProviderRegistry::builtin())
    }

    pub fn with_registry(
        config: RateLimiterConfig,
        store: Arc<dyn SharedCounterStore>,
        registry: &ProviderRegistry,
    ) -> Result<Self> {
        let target = registry.validate(&config.provider, config.endpoint.as_deref())?;
        let base = format!("{}{}", config.key_prefix, target.key());

        info!(
            limiter = %target,
            qpm_limit = %config.qpm_limit,
            concurrent_limit = config.concurrent_limit,
            enabled = config.enabled,
            storage = store.backend_name(),
            "Rate limiter initialized"
        );

        Ok(Self {
            window: FixedWindow::new(config.window),
            concurrent_key: format!("{}:concurrent", base),
            qpm_key_base: format!("{}:qpm", base),
            target,
            config,
            store,
            counters: LocalCounters::default(),
        })
    }

    pub fn target(&self) -> &ProviderEndpoint {
        &self.target
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn concurrent_key(&self) -> &str {
        &self.concurrent_key
    }

    /// QPM key of the window that is open right now.
    pub fn qpm_key(&self) -> String {
        self.qpm_key_for(self.window.current().id)
    }

    fn qpm_key_for(&self, window_id: i64) -> String {
        format!("{}:{}", self.qpm_key_base, window_id)
    }

    /// Wait for admission, bounded by the configured default timeout.
    pub async fn acquire(&self) -> Result<Permit> {
        self.acquire_with(self.config.acquire_timeout, None).await
    }

    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Permit> {
        self.acquire_with(Some(timeout), None).await
    }

    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<Permit> {
        self.acquire_with(self.config.acquire_timeout, Some(cancel))
            .await
    }

    /// Wait until both ceilings admit one more request.
    ///
    /// Stops early with `Cancelled` when `cancel` fires and with
    /// `AcquireTimeout` once `timeout` has passed. Store failures surface as
    /// `StoreUnavailable` without retrying.
    pub async fn acquire_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Permit> {
        if !self.config.enabled {
            return Ok(Permit::passthrough());
        }

        let started = Instant::now();
        let mut waited = false;

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancelled => Err(GateError::Cancelled(self.target.to_string())),
            result = self.admit(&mut waited) => result,
            _ = deadline => Err(GateError::AcquireTimeout {
                limiter: self.target.to_string(),
                waited: started.elapsed(),
            }),
        };

        if waited {
            let waited_ms = started.elapsed().as_millis() as u64;
            self.counters.total_waits.fetch_add(1, Ordering::Relaxed);
            self.counters
                .total_wait_ms
                .fetch_add(waited_ms, Ordering::Relaxed);
            debug!(limiter = %self.target, waited_ms, ok = outcome.is_ok(), "Finished waiting for admission");
        }
        if outcome.is_ok() {
            self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Admission loop. Takes a concurrency slot first, then a QPM unit; a
    /// refused QPM unit hands the slot back before waiting for rollover.
    async fn admit(&self, waited: &mut bool) -> Result<Permit> {
        loop {
            let slot = self
                .store
                .increment_within(
                    &self.concurrent_key,
                    self.config.concurrent_limit,
                    Some(self.config.concurrency_ttl),
                )
                .await?;

            if !slot.is_admitted() {
                if !*waited {
                    debug!(
                        limiter = %self.target,
                        active = slot.value(),
                        limit = self.config.concurrent_limit,
                        "Concurrency limit reached, waiting"
                    );
                }
                *waited = true;
                tokio::time::sleep(self.jittered(self.config.concurrency_backoff)).await;
                continue;
            }

            let permit = Permit::held(
                self.store.clone(),
                self.concurrent_key.clone(),
                self.target.to_string(),
            );

            let Some(qpm_limit) = self.config.qpm_limit.as_limit() else {
                trace!(limiter = %self.target, active = slot.value(), "Admitted");
                return Ok(permit);
            };

            let window = self.window.current();
            let key = self.qpm_key_for(window.id);
            match self
                .store
                .increment_within(&key, qpm_limit, Some(self.window.key_ttl()))
                .await
            {
                Ok(count) if count.is_admitted() => {
                    trace!(
                        limiter = %self.target,
                        active = slot.value(),
                        qpm = count.value(),
                        "Admitted"
                    );
                    return Ok(permit);
                }
                Ok(count) => {
                    permit.release().await;
                    if !*waited {
                        warn!(
                            limiter = %self.target,
                            qpm = count.value(),
                            limit = qpm_limit,
                            wait_ms = window.remaining.as_millis() as u64,
                            "QPM limit reached, waiting for next window"
                        );
                    }
                    *waited = true;
                    tokio::time::sleep(self.jittered(window.remaining)).await;
                }
                Err(e) => {
                    permit.release().await;
                    return Err(e);
                }
            }
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Acquire, run `fut`, release. The slot is also returned if the
    /// surrounding task is cancelled or `fut` panics.
    pub async fn scoped<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let permit = self.acquire().await?;
        let output = fut.await;
        permit.release().await;
        Ok(output)
    }

    /// Whether an acquire right now would be admitted without waiting.
    ///
    /// Only reads counters; a `true` is advisory and may be stale by the time
    /// the caller acquires.
    pub async fn can_acquire_now(&self) -> Result<bool> {
        if !self.config.enabled {
            return Ok(true);
        }

        let active = self.store.get(&self.concurrent_key).await?.unwrap_or(0);
        if active >= self.config.concurrent_limit {
            return Ok(false);
        }

        match self.config.qpm_limit.as_limit() {
            Some(limit) => {
                let current = self.store.get(&self.qpm_key()).await?.unwrap_or(0);
                Ok(current < limit)
            }
            None => Ok(true),
        }
    }

    /// Snapshot of limits, shared counters and local totals.
    ///
    /// A disabled limiter reports zero counts without reading the store.
    pub async fn get_stats(&self) -> Result<LimiterStats> {
        let qpm_key = self.qpm_key();
        let (current_qpm, active_requests) = if self.config.enabled {
            let qpm = if self.config.qpm_limit.is_unlimited() {
                0
            } else {
                self.store.get(&qpm_key).await?.unwrap_or(0)
            };
            let active = self.store.get(&self.concurrent_key).await?.unwrap_or(0);
            (qpm, active)
        } else {
            (0, 0)
        };

        let total_waits = self.counters.total_waits.load(Ordering::Relaxed);
        let total_wait_ms = self.counters.total_wait_ms.load(Ordering::Relaxed);
        let avg_wait_ms = if total_waits > 0 {
            total_wait_ms as f64 / total_waits as f64
        } else {
            0.0
        };

        Ok(LimiterStats {
            enabled: self.config.enabled,
            provider: self.target.provider.clone(),
            endpoint: self.target.endpoint.clone(),
            qpm_limit: self.config.qpm_limit,
            concurrent_limit: self.config.concurrent_limit,
            current_qpm,
            active_requests,
            qpm_key,
            concurrent_key: self.concurrent_key.clone(),
            storage: self.store.backend_name().to_string(),
            worker_id: worker_id().to_string(),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            total_waits,
            total_wait_ms,
            avg_wait_ms,
        })
    }

    /// Reset the concurrency counter and the current and previous QPM windows.
    ///
    /// For tests and administration only: clearing a limiter that is serving
    /// traffic lets it overrun its quota.
    pub async fn clear_state(&self) -> Result<()> {
        let window = self.window.current();
        self.store.reset(&self.concurrent_key).await?;
        self.store.reset(&self.qpm_key_for(window.id)).await?;
        self.store.reset(&self.qpm_key_for(window.id - 1)).await?;
        warn!(limiter = %self.target, "Rate limiter state cleared");
        Ok(())
    }
}
