//! GCRA (Generic Cell Rate Algorithm) rate limiter implementation
//!
//! This module provides the main [`RateLimiter`] struct which implements
//! the GCRA algorithm for smooth, fair admission control with burst support.

use super::{CellError, Quota, store::Store};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Attempts made when a compare-and-swap loses a race before giving up
const MAX_RETRIES: u32 = 10;

/// Result of a rate limit check
///
/// Contains information about the current state of the rate limiter for a given key.
/// A fresh value is produced for every decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// The maximum number of requests allowed in a burst
    pub limit: i64,
    /// The number of requests that could still be made right now
    pub remaining: i64,
    /// Time until the bucket is back at full burst capacity
    pub reset_after: Duration,
    /// Time to wait before the request would be allowed (0 if it was allowed)
    pub retry_after: Duration,
}

/// GCRA (Generic Cell Rate Algorithm) Rate Limiter
///
/// Pairs a [`Quota`] with a [`Store`] holding the theoretical arrival time
/// (TAT) of every key. Stores synchronize internally, so a single limiter can
/// be shared across tasks behind an `Arc`.
///
/// # Example
///
/// ```
/// use scopecrab::{LruStore, Period, Quota, RateLimiter};
/// use std::time::SystemTime;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// // Allow 100 requests per minute with a burst of 10
/// let quota = Quota::new(100, Period::Minute, 10).unwrap();
/// let limiter = RateLimiter::new(LruStore::new(), quota);
///
/// let (allowed, result) = limiter
///     .rate_limit("api_key", 1, SystemTime::now())
///     .await
///     .unwrap();
/// assert!(allowed);
/// assert_eq!(result.remaining, 9);
/// # }
/// ```
pub struct RateLimiter<S: Store> {
    store: S,
    quota: Quota,
}

impl<S: Store> RateLimiter<S> {
    /// Create a new rate limiter over `store` enforcing `quota`
    pub fn new(store: S, quota: Quota) -> Self {
        RateLimiter { store, quota }
    }

    /// The quota this limiter enforces
    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// The backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Check if `quantity` cells for `key` are admissible at `now`
    ///
    /// Admissible requests advance the key's TAT atomically; denied requests
    /// leave it untouched. A quantity of `0` reports the current state without
    /// writing to the store.
    ///
    /// # Returns
    ///
    /// Returns a tuple of:
    /// - `bool`: Whether the request is allowed
    /// - [`RateLimitResult`]: Current state of the rate limiter
    ///
    /// # Errors
    ///
    /// - [`CellError::NegativeQuantity`]: If quantity is negative
    /// - [`CellError::Store`]: If the store failed
    /// - [`CellError::Internal`]: If `now` predates the Unix epoch or the
    ///   compare-and-swap kept losing races
    pub async fn rate_limit(
        &self,
        key: &str,
        quantity: i64,
        now: SystemTime,
    ) -> Result<(bool, RateLimitResult), CellError> {
        if quantity < 0 {
            return Err(CellError::NegativeQuantity(quantity));
        }

        let now_ns = now
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CellError::Internal(format!("system time error: {e}")))?
            .as_nanos()
            .min(i64::MAX as u128) as i64;

        let emission_interval_ns = duration_to_ns(self.quota.emission_interval());
        // One interval for the request itself plus the tolerated run-ahead
        let burst_ns = duration_to_ns(self.quota.delay_variation_tolerance())
            .saturating_add(emission_interval_ns);
        let limit = self.quota.max_burst() as i64;

        let mut retries = 0;
        loop {
            let stored = self
                .store
                .get(key, now)
                .await
                .map_err(CellError::Store)?;

            // A TAT in the past means the bucket has fully drained
            let tat = stored.map_or(now_ns, |t| t.max(now_ns));
            let new_tat = tat.saturating_add(emission_interval_ns.saturating_mul(quantity));
            let allow_at = new_tat.saturating_sub(burst_ns);
            let allowed = now_ns >= allow_at;

            if allowed && quantity > 0 {
                let ttl = Duration::from_nanos(new_tat.saturating_sub(now_ns).max(0) as u64);

                let swapped = match stored {
                    Some(old) => self
                        .store
                        .compare_and_swap_with_ttl(key, old, new_tat, ttl, now)
                        .await
                        .map_err(CellError::Store)?,
                    None => self
                        .store
                        .set_if_not_exists_with_ttl(key, new_tat, ttl, now)
                        .await
                        .map_err(CellError::Store)?,
                };

                if !swapped {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(CellError::Internal("max retries exceeded".into()));
                    }
                    continue;
                }
            }

            let current_tat = if allowed { new_tat } else { tat };
            let tat_from_now = current_tat.saturating_sub(now_ns).max(0);

            let remaining = if emission_interval_ns == 0 {
                limit
            } else {
                (burst_ns.saturating_sub(tat_from_now) / emission_interval_ns).clamp(0, limit)
            };

            let retry_after = if allowed {
                Duration::ZERO
            } else {
                Duration::from_nanos(allow_at.saturating_sub(now_ns).max(0) as u64)
            };

            return Ok((
                allowed,
                RateLimitResult {
                    limit,
                    remaining,
                    reset_after: Duration::from_nanos(tat_from_now as u64),
                    retry_after,
                },
            ));
        }
    }
}

fn duration_to_ns(d: Duration) -> i64 {
    d.as_nanos().min(i64::MAX as u128) as i64
}
