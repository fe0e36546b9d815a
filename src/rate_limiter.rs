use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use crate::error::ForgeError;
use crate::metrics;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Process-wide gate in front of the block explorer API.
///
/// Burst is pinned to one cell so permits are evenly spaced at `1/rate` seconds. That keeps any
/// one-second window at or below `rate` acquisitions, which a full-size burst would not.
/// Cloning shares the underlying limiter.
#[derive(Clone)]
pub struct ExplorerRateLimiter {
    limiter: Arc<DirectRateLimiter>,
    per_second: u32,
}

impl ExplorerRateLimiter {
    pub fn new(per_second: u32) -> Result<Self, ForgeError> {
        let rate = NonZeroU32::new(per_second)
            .ok_or_else(|| ForgeError::Config("rate limit must be non-zero".into()))?;
        let quota = Quota::per_second(rate).allow_burst(NonZeroU32::MIN);
        Ok(Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            per_second,
        })
    }

    /// Waits until a permit is available.
    pub async fn acquire(&self) {
        let started = Instant::now();
        self.limiter.until_ready().await;
        metrics::record_limiter_wait(started.elapsed());
    }

    /// Takes a permit only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn per_second(&self) -> u32 {
        self.per_second
    }
}

impl std::fmt::Debug for ExplorerRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplorerRateLimiter")
            .field("per_second", &self.per_second)
            .finish()
    }
}
