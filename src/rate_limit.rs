use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::RateLimitError;

/// Grants at most one permit per call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// `Ok(false)` means the bucket is empty right now.
    async fn try_acquire(&self) -> Result<bool, RateLimitError>;
}

/// Process-local token bucket with interval refill.
///
/// Starts full. Each complete `refill_period` since the last refill adds
/// `refill_tokens`, capped at `capacity`; partial periods add nothing.
/// Use [`crate::RedisTokenBucket`] when several processes share one budget.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_tokens: u64,
    refill_period: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_tokens: u64, refill_period: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_tokens: refill_tokens.max(1),
            refill_period: refill_period.max(Duration::from_millis(1)),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_tokens, config.refill_period)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let periods = (elapsed.as_nanos() / self.refill_period.as_nanos()) as u64;
        if periods == 0 {
            return;
        }

        let added = periods.saturating_mul(self.refill_tokens);
        state.tokens = state.tokens.saturating_add(added).min(self.capacity);
        state.last_refill += self.refill_period * periods.min(u32::MAX as u64) as u32;
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn try_acquire(&self) -> Result<bool, RateLimitError> {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());

        if state.tokens >= 1 {
            state.tokens -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
