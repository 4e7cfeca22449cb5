use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::config::RateLimitConfig;
use crate::error::RateLimitError;
use crate::rate_limit::RateLimiter;

// Interval refill evaluated against the server clock so every instance
// agrees on elapsed time. The bucket expires once it would be full again
// plus a keep-alive, so idle buckets do not linger.
const TRY_ACQUIRE_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local keep_alive = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

if now > last then
  local periods = math.floor((now - last) / period)
  if periods > 0 then
    tokens = math.min(capacity, tokens + periods * refill)
    last = last + periods * period
  end
end

local granted = 0
if tokens >= 1 then
  tokens = tokens - 1
  granted = 1
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last)
local ttl = math.ceil((capacity - tokens) / refill) * period + keep_alive
redis.call('PEXPIRE', KEYS[1], ttl)
return granted
"#;

/// Token bucket shared by every process pointing at the same Redis and key.
///
/// Each acquisition is a single atomic script execution, so concurrent
/// instances never both spend the last token.
pub struct RedisTokenBucket {
    conn: ConnectionManager,
    key: String,
    config: RateLimitConfig,
    script: Script,
}

impl RedisTokenBucket {
    pub fn new(conn: ConnectionManager, config: RateLimitConfig) -> Self {
        Self {
            conn,
            key: format!("rate-limit:{}", config.key),
            config,
            script: Script::new(TRY_ACQUIRE_LUA),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisTokenBucket {
    async fn try_acquire(&self) -> Result<bool, RateLimitError> {
        let mut conn = self.conn.clone();
        let granted: i64 = self
            .script
            .key(&self.key)
            .arg(self.config.capacity.max(1))
            .arg(self.config.refill_tokens.max(1))
            .arg((self.config.refill_period.as_millis() as u64).max(1))
            .arg(self.config.keep_alive.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }
}
