use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{AcknowledgeError, EnqueueError, FetchError};
use crate::queue::{decode_delivery, SigningQueue};
use crate::types::{ReceiptHandle, SignRequest};

// KEYS: ready, inflight, bodies, deliveries
// ARGV: visibility_ms, max
// Returns a flat [receipt, body, receipt, body, ...] array.
const RECEIVE_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, receipt in ipairs(expired) do
  redis.call('ZREM', KEYS[2], receipt)
  local id = string.match(receipt, '^(.*):%d+$')
  if id and redis.call('HEXISTS', KEYS[3], id) == 1 then
    redis.call('LPUSH', KEYS[1], id)
  end
end

local out = {}
local max = tonumber(ARGV[2])
local taken = 0
while taken < max do
  local id = redis.call('LPOP', KEYS[1])
  if not id then break end
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    local receipt = id .. ':' .. redis.call('INCR', KEYS[4])
    redis.call('ZADD', KEYS[2], now + tonumber(ARGV[1]), receipt)
    table.insert(out, receipt)
    table.insert(out, body)
    taken = taken + 1
  end
end
return out
"#;

// KEYS: inflight, bodies
// ARGV: receipt, id
// Returns 1 when the delivery was still in flight and got deleted.
const DELETE_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local visible_at = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not visible_at or tonumber(visible_at) <= now then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[2])
return 1
"#;

/// Durable queue stored in Redis.
///
/// Layout under the queue-name prefix:
/// - `{q}:ready`: list of visible message ids
/// - `{q}:bodies`: hash of message id to wire body
/// - `{q}:inflight`: sorted set of receipt handle to visible-at (ms)
/// - `{q}:deliveries`: counter minting receipt handles
///
/// A receipt handle is `"{message id}:{delivery number}"`, so each fetch
/// of the same message yields a new handle and stale ones are rejected.
pub struct RedisQueue {
    conn: ConnectionManager,
    config: QueueConfig,
    receive: Script,
    delete: Script,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, config: QueueConfig) -> Self {
        Self {
            conn,
            config,
            receive: Script::new(RECEIVE_LUA),
            delete: Script::new(DELETE_LUA),
        }
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.config.queue_name)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.config.queue_name)
    }

    fn bodies_key(&self) -> String {
        format!("{}:bodies", self.config.queue_name)
    }

    fn deliveries_key(&self) -> String {
        format!("{}:deliveries", self.config.queue_name)
    }

    fn message_id(receipt: &ReceiptHandle) -> Option<&str> {
        receipt
            .as_str()
            .rsplit_once(':')
            .map(|(id, _)| id)
            .filter(|id| !id.is_empty())
    }

    async fn receive_once(&self) -> Result<Vec<(ReceiptHandle, String)>, FetchError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .receive
            .key(self.ready_key())
            .key(self.inflight_key())
            .key(self.bodies_key())
            .key(self.deliveries_key())
            .arg(self.config.visibility_timeout.as_millis() as u64)
            .arg(self.config.batch_size())
            .invoke_async(&mut conn)
            .await?;

        Ok(flat
            .chunks_exact(2)
            .map(|pair| (ReceiptHandle(pair[0].clone()), pair[1].clone()))
            .collect())
    }
}

#[async_trait]
impl SigningQueue for RedisQueue {
    async fn schedule(&self, request: &SignRequest) -> Result<(), EnqueueError> {
        let body = request.to_wire()?;
        let id = Uuid::new_v4().to_string();
        trace!(%id, %body, "sending message");

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(self.bodies_key(), &id, &body)
            .ignore()
            .rpush(self.ready_key(), &id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn fetch_batch(&self) -> Result<Vec<SignRequest>, FetchError> {
        trace!(queue = %self.config.queue_name, "receive messages");
        let deadline = Instant::now() + self.config.wait_time;

        loop {
            let deliveries = self.receive_once().await?;
            if !deliveries.is_empty() {
                return Ok(deliveries
                    .into_iter()
                    .filter_map(|(receipt, body)| decode_delivery(&body, receipt))
                    .collect());
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, request: &SignRequest) -> Result<(), AcknowledgeError> {
        let receipt = request
            .receipt_handle
            .as_ref()
            .ok_or(AcknowledgeError::MissingReceipt)?;
        let id = Self::message_id(receipt).ok_or_else(|| AcknowledgeError::InvalidReceipt {
            receipt: receipt.to_string(),
        })?;

        debug!(queue = %self.config.queue_name, %receipt, "delete message");

        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete
            .key(self.inflight_key())
            .key(self.bodies_key())
            .arg(receipt.as_str())
            .arg(id)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 1 {
            Ok(())
        } else {
            Err(AcknowledgeError::InvalidReceipt {
                receipt: receipt.to_string(),
            })
        }
    }
}
