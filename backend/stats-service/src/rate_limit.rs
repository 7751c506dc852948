//! Handler throughput ceiling
//!
//! One limiter is shared by every claim task of a consumer process, so the
//! ceiling applies to the process as a whole rather than per partition.

use governor::{DefaultDirectRateLimiter, Quota};
use std::num::NonZeroU32;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("rate limit must be greater than zero")]
pub struct ZeroRate;

pub struct RateLimiter {
    limiter: DefaultDirectRateLimiter,
    per_second: u32,
}

impl RateLimiter {
    /// Allow at most `per_second` operations per second, evenly spaced.
    pub fn per_second(per_second: u32) -> Result<Self, ZeroRate> {
        let rate = NonZeroU32::new(per_second).ok_or(ZeroRate)?;
        let quota = Quota::per_second(rate).allow_burst(NonZeroU32::MIN);

        Ok(Self {
            limiter: governor::RateLimiter::direct(quota),
            per_second,
        })
    }

    /// Wait for the next slot
    pub async fn take(&self) {
        self.limiter.until_ready().await;
    }

    pub fn per_second_limit(&self) -> u32 {
        self.per_second
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.per_second)
            .finish()
    }
}
