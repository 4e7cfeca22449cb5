use thiserror::Error;

/// A request was rejected before it entered the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("webhook url is not an absolute http(s) url: {url}")]
    InvalidWebhookUrl { url: String },
}

/// Placing a request on the durable queue failed.
/// The caller may retry or drop the request.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("failed to serialize sign request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("queue backend error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Receiving a batch from the durable queue failed.
/// An empty batch after the wait interval is not an error.
#[derive(Debug, Error)]
pub enum FetchError {
    #[cfg(feature = "redis")]
    #[error("queue backend error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Deleting a delivery failed. Never fatal: the delivery becomes visible
/// again once its visibility window expires.
#[derive(Debug, Error)]
pub enum AcknowledgeError {
    #[error("request carries no receipt handle")]
    MissingReceipt,

    #[error("receipt handle is unknown or expired: {receipt}")]
    InvalidReceipt { receipt: String },

    #[cfg(feature = "redis")]
    #[error("queue backend error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// The shared rate-limit store could not be consulted.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[cfg(feature = "redis")]
    #[error("rate limit store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Webhook delivery could not be attempted or did not complete.
/// A non-success status is reported as `Ok(false)`, not as an error.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("webhook transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors surfaced by [`crate::SigningService::sign_or_schedule`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}
