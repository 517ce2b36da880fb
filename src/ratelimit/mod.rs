//! Rate limiting logic and state management.

mod algorithm;
mod limiter;
mod store;
mod wait;
mod window;

pub use algorithm::{Algorithm, SlidingWindow};
pub use limiter::{Limiter, SlidingWindowLimiter, SlidingWindowToken, Token};
pub use store::LimiterStore;
pub use wait::{consume_and_wait, consume_n_and_wait, wait, wait_for};
pub use window::{WindowState, MAX_INTERVAL};
