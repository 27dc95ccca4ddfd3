//! # ScopeCrab
//!
//! GCRA (Generic Cell Rate Algorithm) admission control with pluggable atomic stores.
//!
//! ## Overview
//!
//! ScopeCrab tracks a theoretical arrival time (TAT) per key and admits a request
//! when advancing that TAT stays within the configured burst. This gives:
//! - **Smooth traffic shaping**: requests are spread at the emission interval
//! - **Bounded bursts**: a fresh key may make `burst` requests back to back
//! - **O(1) state per key**: a single `i64` in the store
//!
//! ## Quick Start
//!
//! ```
//! use scopecrab::{LruStore, Quota, RateLimiter};
//! use std::time::SystemTime;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), scopecrab::CellError> {
//! // 1 request per minute ("i"), burst of 3
//! let quota = Quota::parse(1, "i", 3)?;
//! let limiter = RateLimiter::new(LruStore::new(), quota);
//!
//! let (allowed, result) = limiter.rate_limit("203.0.113.7", 1, SystemTime::now()).await?;
//!
//! if allowed {
//!     println!("Request allowed! Remaining: {}", result.remaining);
//! } else {
//!     println!("Rate limited! Retry after: {} seconds", result.retry_after.as_secs());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Period codes
//!
//! | Code | Period |
//! |------|--------|
//! | `s`  | second |
//! | `i`  | minute |
//! | `h`  | hour   |
//! | `d`  | day    |
//!
//! ## Stores
//!
//! A [`Store`] holds the TAT for each key and provides atomic
//! compare-and-swap. [`LruStore`] is the in-process implementation, bounded by
//! a key count:
//!
//! ```
//! use scopecrab::LruStore;
//!
//! let store = LruStore::builder().max_keys(100_000).build();
//! ```
//!
//! Networked stores implement the same trait so several processes can share
//! one set of buckets.
//!
//! ## Thread Safety
//!
//! Stores synchronize internally and [`RateLimiter::rate_limit`] takes `&self`,
//! so a limiter can be shared directly behind an `Arc`.
//!
//! ## Features
//!
//! - `ahash` (default): Use AHash for faster hashing

pub mod core;

pub use core::{
    CellError, LruStore, LruStoreBuilder, Period, Quota, Rate, RateLimitResult, RateLimiter,
    Store,
};

// Re-export the store module so benchmarks can access it
pub use crate::core::store;
