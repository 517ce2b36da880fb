//! Blocking helpers that combine consuming capacity with waiting for it.

use std::time::{Duration, Instant};

use tracing::trace;

use super::limiter::{Limiter, Token};
use crate::context::Context;
use crate::error::{Result, WindmillError};

/// Suspend until `deadline`, or until `ctx` is done.
///
/// Returns `Ok(())` when the deadline is reached first and the context's
/// error when the context finishes first.
pub async fn wait(ctx: &Context, deadline: Instant) -> Result<()> {
    if let Some(err) = ctx.err() {
        return Err(err.into());
    }

    tokio::select! {
        reason = ctx.done() => Err(reason.into()),
        _ = tokio::time::sleep_until(deadline.into()) => Ok(()),
    }
}

/// Suspend for `delay`, or until `ctx` is done.
///
/// A delay too large to represent as an instant only ends with the context.
pub async fn wait_for(ctx: &Context, delay: Duration) -> Result<()> {
    match Instant::now().checked_add(delay) {
        Some(deadline) => wait(ctx, deadline).await,
        None => {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }
            Err(ctx.done().await.into())
        }
    }
}

/// Consume one unit, or wait until the limiter resets.
///
/// Does not retry after waiting; the caller decides what to do next.
pub async fn consume_and_wait(ctx: &Context, limiter: &dyn Limiter) -> Result<()> {
    let token = limiter.take();
    consume_or_wait(ctx, token.as_ref()).await
}

/// Consume `n` units at once, or wait until enough of them are back.
pub async fn consume_n_and_wait(ctx: &Context, limiter: &dyn Limiter, n: u64) -> Result<()> {
    let token = limiter.take_n(n)?;
    consume_or_wait(ctx, token.as_ref()).await
}

async fn consume_or_wait(ctx: &Context, token: &dyn Token) -> Result<()> {
    match token.consume() {
        Ok(()) => Ok(()),
        Err(WindmillError::RateLimitExceeded) => {
            // Measured on the limiter's clock, which need not be the system one
            let delay = token.retry_after();
            trace!(delay = ?delay, "Waiting for capacity");
            wait_for(ctx, delay).await
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::context::ContextError;
    use crate::ratelimit::SlidingWindowLimiter;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_reaches_deadline() {
        let ctx = Context::background();
        let start = Instant::now();

        wait(&ctx, start + Duration::from_millis(20)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_wait_cancelled_before_deadline() {
        let ctx = Context::background().with_cancel();
        let handle = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let result = wait(&ctx, Instant::now() + Duration::from_secs(30)).await;
        assert_eq!(result, Err(WindmillError::Context(ContextError::Canceled)));
    }

    #[tokio::test]
    async fn test_wait_context_deadline_first() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));

        let result = wait(&ctx, Instant::now() + Duration::from_secs(30)).await;
        assert_eq!(
            result,
            Err(WindmillError::Context(ContextError::DeadlineExceeded))
        );
    }

    #[tokio::test]
    async fn test_wait_already_cancelled() {
        let ctx = Context::background();
        ctx.cancel();

        let result = wait(&ctx, Instant::now()).await;
        assert_eq!(result, Err(WindmillError::Context(ContextError::Canceled)));
    }

    #[tokio::test]
    async fn test_wait_for_unrepresentable_delay_ends_with_context() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));

        let result = wait_for(&ctx, Duration::MAX).await;
        assert_eq!(
            result,
            Err(WindmillError::Context(ContextError::DeadlineExceeded))
        );
    }

    #[tokio::test]
    async fn test_consume_and_wait_longest_interval_cancelled() {
        let limiter = SlidingWindowLimiter::new(
            1,
            crate::ratelimit::MAX_INTERVAL,
            2,
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        limiter.take().consume().unwrap();

        let ctx = Context::background();
        ctx.cancel();

        let result = consume_and_wait(&ctx, &limiter).await;
        assert_eq!(result, Err(WindmillError::Context(ContextError::Canceled)));
    }

    #[tokio::test]
    async fn test_consume_and_wait_returns_immediately_with_capacity() {
        let limiter =
            SlidingWindowLimiter::new(1, Duration::from_secs(3600), 2, Arc::new(SystemClock))
                .unwrap();
        let ctx = Context::background().with_timeout(Duration::from_secs(1));

        consume_and_wait(&ctx, &limiter).await.unwrap();
        assert_eq!(limiter.tokens(&ctx).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_and_wait_waits_for_reset() {
        let limiter =
            SlidingWindowLimiter::new(1, Duration::from_millis(100), 2, Arc::new(SystemClock))
                .unwrap();
        let ctx = Context::background();
        limiter.take().consume().unwrap();

        let start = Instant::now();
        consume_and_wait(&ctx, &limiter).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_consume_and_wait_cancelled() {
        let clock = Arc::new(ManualClock::new());
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60), 2, clock).unwrap();
        limiter.take().consume().unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let result = consume_and_wait(&ctx, &limiter).await;
        assert_eq!(
            result,
            Err(WindmillError::Context(ContextError::DeadlineExceeded))
        );
    }

    #[tokio::test]
    async fn test_consume_and_wait_follows_manual_clock() {
        let clock = Arc::new(ManualClock::new());
        let limiter =
            SlidingWindowLimiter::new(1, Duration::from_millis(40), 2, clock.clone()).unwrap();
        limiter.take().consume().unwrap();

        // Most of the window already passed on the limiter's clock
        clock.advance(Duration::from_millis(39));
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        let start = Instant::now();
        consume_and_wait(&ctx, &limiter).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_consume_n_and_wait_invalid_usage() {
        let limiter =
            SlidingWindowLimiter::new(3, Duration::from_secs(1), 2, Arc::new(SystemClock))
                .unwrap();
        let ctx = Context::background();

        let result = consume_n_and_wait(&ctx, &limiter, 4).await;
        assert!(matches!(result, Err(WindmillError::InvalidUsage(_))));
    }

    #[tokio::test]
    async fn test_consume_n_and_wait_consumes_burst() {
        let limiter =
            SlidingWindowLimiter::new(4, Duration::from_secs(3600), 2, Arc::new(SystemClock))
                .unwrap();
        let ctx = Context::background().with_timeout(Duration::from_secs(1));

        consume_n_and_wait(&ctx, &limiter, 3).await.unwrap();
        assert_eq!(limiter.tokens(&ctx).unwrap(), 1);

        let result = consume_n_and_wait(&ctx, &limiter, 2).await;
        assert_eq!(
            result,
            Err(WindmillError::Context(ContextError::DeadlineExceeded))
        );
    }
}
