//! A durable, at-least-once message signing pipeline.
//!
//! Messages that could not be signed synchronously (rate limit or remote
//! failure) are placed on a durable queue. A relay moves them into a
//! bounded in-process buffer, a pool of workers signs each one through a
//! rate-limited signing client, delivers the signature to the caller's
//! webhook, and only then acknowledges the delivery.
//!
//! ## Guarantees
//! - A delivery is acknowledged iff sign, notify and acknowledge all succeed
//! - Bounded memory with backpressure from workers back to the queue
//! - One global signing rate across processes sharing a Redis bucket
//! - No single bad message stops the relay or a worker
//!
//! ## Non-Guarantees
//! - Exactly-once signing or webhook delivery
//! - Ordering across messages
//! - Coordination of the dispatch buffer across processes
//!
//! Failures are never retried in-process. Every abandoned delivery comes
//! back once the durable queue's visibility window expires.

mod callback_signature;
mod config;
mod error;
mod pipeline;
mod queue;
mod rate_limit;
mod relay;
mod service;
mod signer;
mod telemetry;
mod types;
mod webhook;
mod worker;

#[cfg(feature = "redis")]
mod queue_redis;

#[cfg(feature = "redis")]
mod rate_limit_redis;

pub use callback_signature::{compute_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};
pub use config::{
    AppConfig,
    PipelineConfig,
    QueueConfig,
    RateLimitConfig,
    SignerConfig,
    WebhookConfig,
    WorkerArgs,
};
pub use error::{
    AcknowledgeError,
    EnqueueError,
    FetchError,
    RateLimitError,
    ServiceError,
    ValidationError,
    WebhookError,
};
pub use pipeline::{Pipeline, ShutdownOutcome};
pub use queue::{InMemoryQueue, SigningQueue, MAX_BATCH_SIZE};
pub use rate_limit::{RateLimiter, TokenBucket};
pub use relay::relay_loop;
pub use service::{SignOutcome, SigningService};
pub use signer::{HttpSigner, Signer, SigningStats, SigningStatsSnapshot};
pub use telemetry::init_tracing;
pub use types::{ReceiptHandle, SignRequest};
pub use webhook::{HttpWebhookNotifier, WebhookNotifier, SIGNED_MESSAGE_PARAM};
pub use worker::{process_request, worker_loop, DispatchReceiver, ProcessOutcome, WorkerContext};

#[cfg(feature = "redis")]
pub use queue_redis::RedisQueue;

#[cfg(feature = "redis")]
pub use rate_limit_redis::RedisTokenBucket;
