//! Windmill - In-process Sliding Window Rate Limiting
//!
//! This crate decides whether an operation keyed by a client, route or any
//! other string may proceed right now. Each key gets its own limiter that
//! counts events in a trailing window split into segments, and a store keeps
//! one limiter per key while a background task evicts the ones that have
//! fully recovered.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod ratelimit;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{Context, ContextError};
pub use error::{Result, WindmillError};
pub use ratelimit::{
    consume_and_wait, consume_n_and_wait, wait, wait_for, Algorithm, Limiter, LimiterStore, SlidingWindow,
    Token,
};
