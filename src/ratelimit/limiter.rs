//! Limiter and token abstractions, and the sliding window implementation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use super::window::WindowState;
use crate::clock::Clock;
use crate::context::Context;
use crate::error::{Result, WindmillError};

/// Rate limiter for a single key.
///
/// Implementations must be safe to share across tasks; every mutation of
/// the underlying counter happens through [`Token::consume`].
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Events allowed per window.
    fn limit(&self) -> u64;

    /// Capacity left right now.
    fn tokens(&self, ctx: &Context) -> Result<u64>;

    /// A token for a single unit. Taking a token changes nothing.
    fn take(&self) -> Box<dyn Token>;

    /// A token for `n` units consumed together.
    ///
    /// Fails with [`WindmillError::InvalidUsage`] when `n` is zero or larger
    /// than [`limit`](Self::limit), since such a token could never be used.
    fn take_n(&self, n: u64) -> Result<Box<dyn Token>>;
}

/// One attempt to consume capacity from a [`Limiter`].
///
/// A token is a view on its limiter, not a reservation: holding one does
/// not keep capacity aside for it.
pub trait Token: Send + Sync + fmt::Debug {
    /// Whether [`consume`](Self::consume) would succeed right now.
    fn allow(&self) -> bool;

    /// Earliest instant at which the token can be consumed.
    fn resets_at(&self) -> Instant;

    /// Time left until [`resets_at`](Self::resets_at), on the limiter's clock.
    fn retry_after(&self) -> Duration;

    /// Consume the token's units.
    ///
    /// Returns [`WindmillError::RateLimitExceeded`] without touching the
    /// counter when there is not enough capacity. A token can be consumed
    /// successfully only once; later calls fail with
    /// [`WindmillError::InvalidUsage`].
    #[doc(alias = "use")]
    fn consume(&self) -> Result<()>;
}

/// Limiter backed by a segmented sliding window.
pub struct SlidingWindowLimiter {
    /// Events allowed per window
    max_events: u64,
    /// Counter shared with tokens; the lock makes check-and-increment atomic
    state: Arc<Mutex<WindowState>>,
    /// Time source
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter allowing `max_events` per `interval`, tracked in
    /// `segments` buckets.
    pub fn new(
        max_events: u64,
        interval: Duration,
        segments: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let state = WindowState::new(max_events, interval, segments, clock.now())?;
        Ok(Self::from_state(state, clock))
    }

    pub(crate) fn from_state(state: WindowState, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_events: state.max_events(),
            state: Arc::new(Mutex::new(state)),
            clock,
        }
    }

    /// Length of the window.
    pub fn interval(&self) -> Duration {
        self.state.lock().interval()
    }

    fn token(&self, units: u64) -> SlidingWindowToken {
        SlidingWindowToken {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            units,
            spent: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("max_events", &self.max_events)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Limiter for SlidingWindowLimiter {
    fn limit(&self) -> u64 {
        self.max_events
    }

    fn tokens(&self, ctx: &Context) -> Result<u64> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let mut state = self.state.lock();
        Ok(state.available(self.clock.now()))
    }

    fn take(&self) -> Box<dyn Token> {
        Box::new(self.token(1))
    }

    fn take_n(&self, n: u64) -> Result<Box<dyn Token>> {
        if n == 0 {
            return Err(WindmillError::InvalidUsage(
                "cannot take zero units".to_string(),
            ));
        }
        if n > self.max_events {
            return Err(WindmillError::InvalidUsage(format!(
                "requested {} units but the limit is {}",
                n, self.max_events
            )));
        }
        Ok(Box::new(self.token(n)))
    }
}

/// Token issued by a [`SlidingWindowLimiter`].
pub struct SlidingWindowToken {
    state: Arc<Mutex<WindowState>>,
    clock: Arc<dyn Clock>,
    /// Units consumed at once
    units: u64,
    /// Set after the first successful consume; only touched under the state lock
    spent: AtomicBool,
}

impl fmt::Debug for SlidingWindowToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowToken")
            .field("units", &self.units)
            .field("spent", &self.spent.load(Ordering::Relaxed))
            .finish()
    }
}

impl Token for SlidingWindowToken {
    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        state.available(self.clock.now()) >= self.units
    }

    fn resets_at(&self) -> Instant {
        let mut state = self.state.lock();
        state.resets_at(self.clock.now(), self.units)
    }

    fn retry_after(&self) -> Duration {
        let mut state = self.state.lock();
        let now = self.clock.now();
        state.resets_at(now, self.units).saturating_duration_since(now)
    }

    fn consume(&self) -> Result<()> {
        let mut state = self.state.lock();

        if self.spent.load(Ordering::Acquire) {
            return Err(WindmillError::InvalidUsage(
                "token has already been used".to_string(),
            ));
        }

        let available = state.available(self.clock.now());
        if available < self.units {
            trace!(
                units = self.units,
                available = available,
                "Rate limit exceeded"
            );
            return Err(WindmillError::RateLimitExceeded);
        }

        state.increment_by(self.units);
        self.spent.store(true, Ordering::Release);

        trace!(
            units = self.units,
            remaining = available - self.units,
            "Token consumed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn manual_limiter(
        max_events: u64,
        interval: Duration,
        segments: usize,
    ) -> (Arc<ManualClock>, SlidingWindowLimiter) {
        let clock = Arc::new(ManualClock::new());
        let limiter =
            SlidingWindowLimiter::new(max_events, interval, segments, clock.clone()).unwrap();
        (clock, limiter)
    }

    #[test]
    fn test_limit_is_fixed() {
        let (_, limiter) = manual_limiter(7, Duration::from_secs(1), 4);
        assert_eq!(limiter.limit(), 7);
        assert_eq!(limiter.tokens(&Context::background()).unwrap(), 7);
    }

    #[test]
    fn test_take_has_no_side_effect() {
        let (_, limiter) = manual_limiter(2, Duration::from_secs(1), 2);
        let ctx = Context::background();

        let _a = limiter.take();
        let _b = limiter.take();
        let _c = limiter.take();
        assert_eq!(limiter.tokens(&ctx).unwrap(), 2);
    }

    #[test]
    fn test_capacity_bound() {
        let (_, limiter) = manual_limiter(5, Duration::from_secs(1), 4);

        for _ in 0..5 {
            assert!(limiter.take().consume().is_ok());
        }

        let token = limiter.take();
        assert!(!token.allow());
        assert_eq!(token.consume(), Err(WindmillError::RateLimitExceeded));
    }

    #[test]
    fn test_full_recovery() {
        let (clock, limiter) = manual_limiter(3, Duration::from_secs(2), 4);
        let ctx = Context::background();

        for _ in 0..3 {
            limiter.take().consume().unwrap();
        }
        assert_eq!(limiter.tokens(&ctx).unwrap(), 0);

        clock.advance(Duration::from_secs(2));
        assert_eq!(limiter.tokens(&ctx).unwrap(), limiter.limit());
    }

    #[test]
    fn test_two_per_ten_seconds() {
        let (clock, limiter) = manual_limiter(2, Duration::from_secs(10), 2);
        let ctx = Context::background();

        assert!(limiter.take().consume().is_ok());
        assert!(limiter.take().consume().is_ok());
        assert_eq!(
            limiter.take().consume(),
            Err(WindmillError::RateLimitExceeded)
        );

        clock.advance(Duration::from_secs(5));
        assert_eq!(limiter.tokens(&ctx).unwrap(), 0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(limiter.tokens(&ctx).unwrap(), 2);
    }

    #[test]
    fn test_resets_at_bounds() {
        let (clock, limiter) = manual_limiter(3, Duration::from_secs(9), 3);

        for step in 0..20 {
            let _ = limiter.take().consume();
            let token = limiter.take();
            let now = clock.now();
            let reset = token.resets_at();

            if token.allow() {
                assert_eq!(reset, now);
            } else {
                assert!(reset >= now, "step {}", step);
                assert!(reset <= now + Duration::from_secs(9), "step {}", step);
            }
            clock.advance(Duration::from_millis(1300));
        }
    }

    #[test]
    fn test_retry_after_uses_limiter_clock() {
        let (_, limiter) = manual_limiter(1, Duration::from_secs(10), 2);
        limiter.take().consume().unwrap();

        let token = limiter.take();
        assert_eq!(token.retry_after(), Duration::from_secs(10));
    }

    #[test]
    fn test_exceeded_consume_does_not_mutate() {
        let (_, limiter) = manual_limiter(1, Duration::from_secs(10), 2);
        let ctx = Context::background();
        limiter.take().consume().unwrap();

        for _ in 0..3 {
            assert!(limiter.take().consume().is_err());
        }
        assert_eq!(limiter.tokens(&ctx).unwrap(), 0);
    }

    #[test]
    fn test_token_is_single_use() {
        let (_, limiter) = manual_limiter(5, Duration::from_secs(1), 2);
        let ctx = Context::background();
        let token = limiter.take();

        token.consume().unwrap();
        assert!(matches!(
            token.consume(),
            Err(WindmillError::InvalidUsage(_))
        ));
        assert_eq!(limiter.tokens(&ctx).unwrap(), 4);
    }

    #[test]
    fn test_exceeded_token_can_retry_after_reset() {
        let (clock, limiter) = manual_limiter(1, Duration::from_secs(4), 2);
        limiter.take().consume().unwrap();

        let token = limiter.take();
        assert_eq!(token.consume(), Err(WindmillError::RateLimitExceeded));

        clock.advance(Duration::from_secs(4));
        assert!(token.consume().is_ok());
    }

    #[test]
    fn test_tokens_taken_back_to_back_both_succeed() {
        let (_, limiter) = manual_limiter(2, Duration::from_secs(1), 2);

        let a = limiter.take();
        let b = limiter.take();
        assert!(a.allow());
        assert!(b.allow());
        assert!(a.consume().is_ok());
        assert!(b.consume().is_ok());
    }

    #[test]
    fn test_take_n() {
        let (_, limiter) = manual_limiter(5, Duration::from_secs(1), 2);
        let ctx = Context::background();

        limiter.take_n(3).unwrap().consume().unwrap();
        assert_eq!(limiter.tokens(&ctx).unwrap(), 2);

        let token = limiter.take_n(3).unwrap();
        assert!(!token.allow());
        assert_eq!(token.consume(), Err(WindmillError::RateLimitExceeded));
        assert_eq!(limiter.tokens(&ctx).unwrap(), 2);
    }

    #[test]
    fn test_huge_interval_rejected() {
        let result = SlidingWindowLimiter::new(1, Duration::MAX, 2, Arc::new(ManualClock::new()));
        assert!(matches!(result, Err(WindmillError::InvalidInterval(_))));
    }

    #[test]
    fn test_take_n_invalid_usage() {
        let (_, limiter) = manual_limiter(5, Duration::from_secs(1), 2);

        assert!(matches!(
            limiter.take_n(6),
            Err(WindmillError::InvalidUsage(_))
        ));
        assert!(matches!(
            limiter.take_n(0),
            Err(WindmillError::InvalidUsage(_))
        ));
    }

    #[test]
    fn test_tokens_with_cancelled_context() {
        let (_, limiter) = manual_limiter(5, Duration::from_secs(1), 2);
        let ctx = Context::background();
        ctx.cancel();

        assert_eq!(
            limiter.tokens(&ctx),
            Err(WindmillError::Context(crate::context::ContextError::Canceled))
        );
    }

    #[test]
    fn test_concurrent_consume_respects_limit() {
        let limiter = Arc::new(
            SlidingWindowLimiter::new(50, Duration::from_secs(3600), 4, Arc::new(SystemClock))
                .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.take().consume().is_ok())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
