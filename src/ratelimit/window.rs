//! Segmented sliding window counter.
//!
//! The window of length `interval` is split into equal segments. New events
//! land in the newest segment; as time passes segments shift towards the
//! oldest end and fall out of the window. The sum over all segments
//! approximates the number of events in the trailing `interval`, getting
//! closer to an exact sliding count as the number of segments grows.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{Result, WindmillError};

/// Longest accepted window, roughly a century. Reset instants are computed
/// as `now + interval`, which must stay representable.
pub const MAX_INTERVAL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Time-bucketed event counter backing a sliding window limiter.
///
/// Not synchronized on its own; a limiter keeps it behind a mutex.
#[derive(Debug, Clone)]
pub struct WindowState {
    /// Events allowed per window
    max_events: u64,
    /// Length of the whole window
    interval: Duration,
    /// Length of one segment
    segment_width: Duration,
    /// Per-segment counts, oldest first
    segments: VecDeque<u64>,
    /// Start of the oldest segment
    window_start: Instant,
}

impl WindowState {
    /// Create an empty window starting at `now`.
    pub fn new(max_events: u64, interval: Duration, segments: usize, now: Instant) -> Result<Self> {
        if max_events == 0 {
            return Err(WindmillError::InvalidLimit);
        }
        if interval.is_zero() {
            return Err(WindmillError::InvalidInterval(
                "interval must be greater than zero".to_string(),
            ));
        }
        if interval > MAX_INTERVAL {
            return Err(WindmillError::InvalidInterval(format!(
                "interval {:?} exceeds the maximum of {:?}",
                interval, MAX_INTERVAL
            )));
        }
        if segments <= 1 {
            return Err(WindmillError::InvalidSegments(segments));
        }

        let divisor = u32::try_from(segments).map_err(|_| WindmillError::InvalidSegments(segments))?;
        let segment_width = interval / divisor;
        if segment_width.is_zero() {
            return Err(WindmillError::InvalidInterval(format!(
                "interval {:?} is too short for {} segments",
                interval, segments
            )));
        }

        Ok(Self {
            max_events,
            interval,
            segment_width,
            segments: std::iter::repeat(0).take(segments).collect(),
            window_start: now,
        })
    }

    /// An empty window with the same parameters, starting at `now`.
    pub fn restarted(&self, now: Instant) -> Self {
        Self {
            max_events: self.max_events,
            interval: self.interval,
            segment_width: self.segment_width,
            segments: std::iter::repeat(0).take(self.segments.len()).collect(),
            window_start: now,
        }
    }

    /// Events allowed per window.
    pub fn max_events(&self) -> u64 {
        self.max_events
    }

    /// Length of the window.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Length of a single segment.
    pub fn segment_width(&self) -> Duration {
        self.segment_width
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Start of the oldest segment.
    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    /// Age out segments that have left the window as of `now`.
    pub fn advance(&mut self, now: Instant) {
        let mut elapsed = now.saturating_duration_since(self.window_start);

        // Everything recorded is stale; skip the segment-by-segment walk.
        if elapsed >= self.interval {
            self.segments.iter_mut().for_each(|count| *count = 0);
            self.window_start = now;
            return;
        }

        while elapsed >= self.segment_width {
            self.segments.pop_front();
            self.segments.push_back(0);
            self.window_start += self.segment_width;
            elapsed -= self.segment_width;
        }
    }

    /// Events currently inside the window.
    pub fn count(&mut self, now: Instant) -> u64 {
        self.advance(now);
        self.segments.iter().sum()
    }

    /// Remaining capacity in the window.
    pub fn available(&mut self, now: Instant) -> u64 {
        self.max_events.saturating_sub(self.count(now))
    }

    /// Record one event in the newest segment.
    ///
    /// Does not advance the window; call [`available`](Self::available) first.
    pub fn increment(&mut self) {
        self.increment_by(1);
    }

    /// Record `n` events in the newest segment.
    pub fn increment_by(&mut self, n: u64) {
        if let Some(newest) = self.segments.back_mut() {
            *newest = newest.saturating_add(n);
        }
    }

    /// Earliest instant at which `n` units can be available again.
    ///
    /// Returns `now` when they already are. Otherwise walks the segments
    /// from the oldest until enough events would have aged out to cover the
    /// shortfall, and returns the instant that segment leaves the window.
    pub fn resets_at(&mut self, now: Instant, n: u64) -> Instant {
        let available = self.available(now);
        if available >= n {
            return now;
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        let shortfall = n - available;
        let mut freed = 0u64;

        for (index, count) in self.segments.iter().enumerate() {
            freed = freed.saturating_add(*count);
            if freed >= shortfall {
                let ages_out = self.segment_width * (index as u32 + 1);
                return now + ages_out.saturating_sub(elapsed);
            }
        }

        now + self.interval.saturating_sub(elapsed)
    }
}
