//! Limiter factories.
//!
//! A store only needs a way to build a fresh limiter for a key it has not
//! seen; the [`Algorithm`] trait abstracts over how that limiter counts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::limiter::{Limiter, SlidingWindowLimiter};
use super::window::WindowState;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Builds limiters for a [`LimiterStore`](super::LimiterStore).
pub trait Algorithm: Send + Sync {
    /// Construct a new limiter with full capacity.
    fn build(&self) -> Arc<dyn Limiter>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> Algorithm for F
where
    F: Fn() -> Arc<dyn Limiter> + Send + Sync,
{
    fn build(&self) -> Arc<dyn Limiter> {
        self()
    }
}

/// Sliding window counter algorithm.
///
/// Parameters are validated once here, so every limiter it builds is valid.
#[derive(Clone)]
pub struct SlidingWindow {
    /// Empty window the built limiters start from
    template: WindowState,
    /// Clock handed to every limiter
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    /// Allow `max_events` per `interval`, tracked in `segments` buckets.
    pub fn new(max_events: u64, interval: Duration, segments: usize) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let template = WindowState::new(max_events, interval, segments, clock.now())?;
        Ok(Self { template, clock })
    }

    /// Use `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Events allowed per window.
    pub fn max_events(&self) -> u64 {
        self.template.max_events()
    }

    /// Length of the window.
    pub fn interval(&self) -> Duration {
        self.template.interval()
    }

    /// Number of buckets per window.
    pub fn segments(&self) -> usize {
        self.template.segment_count()
    }

    /// Build a concrete limiter.
    pub fn limiter(&self) -> SlidingWindowLimiter {
        let state = self.template.restarted(self.clock.now());
        SlidingWindowLimiter::from_state(state, Arc::clone(&self.clock))
    }
}

impl fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("max_events", &self.max_events())
            .field("interval", &self.interval())
            .field("segments", &self.segments())
            .field("clock", &self.clock)
            .finish()
    }
}

impl Algorithm for SlidingWindow {
    fn build(&self) -> Arc<dyn Limiter> {
        Arc::new(self.limiter())
    }

    fn name(&self) -> &str {
        "sliding_window"
    }
}
