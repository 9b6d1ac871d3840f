//! Bandwidth shaping shared by every connection of a server
//!
//! One [`Throttle`] holds a read and a write [`TokenBucket`]. Connections
//! charge each socket read or write against the matching bucket and pause
//! that direction for as long as the bucket is in debt.

use crate::config::ThrottlingConfig;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Byte budget refilled at a fixed rate, holding at most one second's worth.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_second: u64) -> Self {
        let rate = bytes_per_second.max(1) as f64;
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `bytes` from the bucket and return how long the caller has to
    /// wait before moving more data. The bucket may go into debt.
    pub fn reserve(&self, bytes: usize) -> Duration {
        self.reserve_at(bytes, Instant::now())
    }

    fn reserve_at(&self, bytes: usize, now: Instant) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);
        state.last_refill = state.last_refill.max(now);
        state.tokens -= bytes as f64;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }
}

/// Read and write limits, each optional
#[derive(Debug, Default)]
pub struct Throttle {
    read: Option<TokenBucket>,
    write: Option<TokenBucket>,
}

impl Throttle {
    /// A rate of 0 leaves that direction unlimited.
    pub fn new(read_bytes_per_second: u64, write_bytes_per_second: u64) -> Self {
        let bucket = |rate: u64| (rate > 0).then(|| TokenBucket::new(rate));
        Self {
            read: bucket(read_bytes_per_second),
            write: bucket(write_bytes_per_second),
        }
    }

    /// `None` when neither direction is limited
    pub fn from_config(config: &ThrottlingConfig) -> Option<Self> {
        config
            .is_enabled()
            .then(|| Self::new(config.read_bytes_per_second, config.write_bytes_per_second))
    }

    /// Pause owed after reading `bytes`, if any
    pub fn read_delay(&self, bytes: usize) -> Option<Duration> {
        delay(self.read.as_ref(), bytes)
    }

    /// Pause owed after writing `bytes`, if any
    pub fn write_delay(&self, bytes: usize) -> Option<Duration> {
        delay(self.write.as_ref(), bytes)
    }
}

fn delay(bucket: Option<&TokenBucket>, bytes: usize) -> Option<Duration> {
    bucket
        .map(|bucket| bucket.reserve(bytes))
        .filter(|delay| !delay.is_zero())
}
