//! Per-key limiter registry.
//!
//! Limiters are created lazily the first time a key is seen and dropped by
//! a background sweep once they have fully recovered. A recovered limiter is
//! indistinguishable from a fresh one, so eviction never changes a decision.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::algorithm::Algorithm;
use super::limiter::Limiter;
use crate::context::Context;
use crate::error::{Result, WindmillError};

/// Registry of limiters indexed by key.
///
/// Must be created inside a tokio runtime, which runs the cleanup task.
///
/// A caller still holding a limiter after it was evicted keeps counting on
/// that detached copy while a fresh one serves the key, so for that overlap
/// the key can admit up to twice its limit.
pub struct LimiterStore {
    /// Limiters indexed by key
    entries: DashMap<String, Arc<dyn Limiter>>,
    /// Factory for limiters of unseen keys
    algorithm: Arc<dyn Algorithm>,
    /// Background sweep
    cleanup_task: JoinHandle<()>,
}

impl LimiterStore {
    /// Create a store and start its cleanup task.
    ///
    /// Every `cleanup_interval` the task evicts limiters that have full
    /// capacity again. It stops when `ctx` is done or the store is dropped.
    pub fn new<A>(ctx: &Context, algorithm: A, cleanup_interval: Duration) -> Result<Arc<Self>>
    where
        A: Algorithm + 'static,
    {
        if cleanup_interval.is_zero() {
            return Err(WindmillError::InvalidInterval(
                "cleanup interval must be greater than zero".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            WindmillError::InvalidUsage("a limiter store needs a running tokio runtime".to_string())
        })?;

        let algorithm: Arc<dyn Algorithm> = Arc::new(algorithm);
        let ctx = ctx.clone();

        let store = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let cleanup_task = runtime.spawn(run_cleanup(weak, ctx, cleanup_interval));
            Self {
                entries: DashMap::new(),
                algorithm,
                cleanup_task,
            }
        });

        Ok(store)
    }

    /// The limiter for `key`, creating it if needed.
    ///
    /// Concurrent callers asking for the same unseen key all get the same
    /// limiter; only one is ever built.
    pub fn limit(&self, ctx: &Context, key: &str) -> Result<Arc<dyn Limiter>> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        if let Some(limiter) = self.entries.get(key) {
            return Ok(Arc::clone(limiter.value()));
        }

        let entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            debug!(
                key = %key,
                algorithm = self.algorithm.name(),
                "Creating new limiter"
            );
            self.algorithm.build()
        });
        Ok(Arc::clone(entry.value()))
    }

    /// Evict every limiter that has fully recovered. Returns how many went.
    pub fn cleanup(&self) -> usize {
        let ctx = Context::background();
        let mut evicted = 0;

        self.entries.retain(|_, limiter| {
            let recovered = matches!(limiter.tokens(&ctx), Ok(tokens) if tokens >= limiter.limit());
            if recovered {
                evicted += 1;
            }
            !recovered
        });

        evicted
    }

    /// The algorithm building this store's limiters.
    pub fn algorithm(&self) -> &dyn Algorithm {
        self.algorithm.as_ref()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the cleanup task is still alive.
    pub fn is_cleanup_running(&self) -> bool {
        !self.cleanup_task.is_finished()
    }
}

impl fmt::Debug for LimiterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterStore")
            .field("algorithm", &self.algorithm.name())
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Drop for LimiterStore {
    fn drop(&mut self) {
        self.cleanup_task.abort();
    }
}

async fn run_cleanup(store: Weak<LimiterStore>, ctx: Context, cleanup_interval: Duration) {
    info!(
        interval = ?cleanup_interval,
        "Limiter cleanup task started"
    );

    let mut ticker = tokio::time::interval(cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(store) = store.upgrade() else {
                    break;
                };
                let evicted = store.cleanup();
                if evicted > 0 {
                    debug!(
                        evicted = evicted,
                        remaining = store.len(),
                        "Evicted recovered limiters"
                    );
                }
            }
            reason = ctx.done() => {
                debug!(reason = %reason, "Limiter store context done");
                break;
            }
        }
    }

    info!("Limiter cleanup task stopped");
}
