//! Core components of the scopecrab admission control library
//!
//! This module contains the fundamental building blocks:
//! - [`rate`]: Rate periods, emission intervals and burst quotas
//! - [`rate_limiter`]: The GCRA rate limiter implementation
//! - [`store`]: Storage backends for the per-key theoretical arrival time

pub mod rate;
pub mod rate_limiter;
pub mod store;

pub use rate::{Period, Quota, Rate};
pub use rate_limiter::{RateLimitResult, RateLimiter};
pub use store::{LruStore, LruStoreBuilder, Store};

use std::error::Error;
use std::fmt;

/// Errors that can occur during rate limiting operations
///
/// # Variants
///
/// - [`NegativeQuantity`](CellError::NegativeQuantity): The quantity parameter was negative
/// - [`InvalidRateLimit`](CellError::InvalidRateLimit): Quota parameters are invalid
/// - [`UnknownPeriod`](CellError::UnknownPeriod): A period unit could not be parsed
/// - [`Store`](CellError::Store): The backing store failed
/// - [`Internal`](CellError::Internal): An internal error occurred (e.g., time calculation error)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    /// The quantity parameter was negative
    NegativeQuantity(i64),
    /// Quota parameters are invalid (requests <= 0 or burst < 0)
    InvalidRateLimit(String),
    /// Unrecognised period unit
    UnknownPeriod(String),
    /// The backing store reported an error
    Store(String),
    /// An internal error occurred
    Internal(String),
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellError::NegativeQuantity(n) => write!(f, "negative quantity: {n}"),
            CellError::InvalidRateLimit(msg) => write!(f, "invalid rate limit parameters: {msg}"),
            CellError::UnknownPeriod(unit) => {
                write!(f, "unknown period unit {unit:?}, expected one of s, i, h, d")
            }
            CellError::Store(msg) => write!(f, "store error: {msg}"),
            CellError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl Error for CellError {}
