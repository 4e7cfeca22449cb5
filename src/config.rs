use std::time::Duration;

use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use secrecy::SecretString;

use crate::queue::MAX_BATCH_SIZE;

/// Durable queue settings shared by every queue binding.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name; the Redis binding uses it as key prefix.
    pub queue_name: String,

    /// Long-poll interval of a single `fetch_batch` call.
    pub wait_time: Duration,

    /// How long a fetched delivery stays hidden before it is redelivered.
    pub visibility_timeout: Duration,

    /// Pause between receive attempts while long-polling.
    pub poll_interval: Duration,

    /// Deliveries per `fetch_batch`, capped at [`MAX_BATCH_SIZE`].
    pub max_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "sign-queue".to_string(),
            wait_time: Duration::from_secs(10),
            visibility_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(250),
            max_batch_size: MAX_BATCH_SIZE,
        }
    }
}

impl QueueConfig {
    pub(crate) fn batch_size(&self) -> usize {
        self.max_batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

/// Token bucket shape. Every full `refill_period` adds `refill_tokens`,
/// never exceeding `capacity`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket name in the shared store. Instances using the same key share one budget.
    pub key: String,
    pub capacity: u64,
    pub refill_tokens: u64,
    pub refill_period: Duration,

    /// Extra lifetime of an idle bucket once it would be full again.
    pub keep_alive: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key: "client".to_string(),
            capacity: 10,
            refill_tokens: 10,
            refill_period: Duration::from_secs(60),
            keep_alive: Duration::from_secs(10),
        }
    }
}

/// Remote signing authority.
#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl SignerConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: SecretString::from(api_key.into()),
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outbound webhook calls.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub connect_timeout: Duration,
    pub timeout: Duration,

    /// When set, callbacks carry an HMAC signature header.
    pub secret: Option<SecretString>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            timeout: Duration::from_secs(2),
            secret: None,
        }
    }
}

impl WebhookConfig {
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(SecretString::from(secret.into()));
        self
    }
}

/// Relay and worker pool sizing.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Dispatch buffer capacity between relay and workers.
    pub buffer_capacity: usize,

    /// Number of concurrent workers.
    pub worker_count: usize,

    /// Bounded wait of a worker on an empty dispatch buffer.
    pub poll_timeout: Duration,

    /// How long shutdown waits for in-flight items before aborting workers.
    pub shutdown_grace: Duration,

    /// Pause after a failed `fetch_batch` before the relay tries again.
    pub fetch_error_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            worker_count: 10,
            poll_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            fetch_error_backoff: Duration::from_secs(1),
        }
    }
}

/// Everything the `signing-worker` binary needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: String,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub signer: SignerConfig,
    pub webhook: WebhookConfig,
    pub pipeline: PipelineConfig,
}

/// Command line and environment surface of the `signing-worker` binary.
///
/// Every option can be given as a flag or through the named variable.
#[derive(Parser)]
#[clap(name = "signing-worker", about = "Asynchronous message signing worker")]
pub struct WorkerArgs {
    #[clap(long, env = "API_KEY", value_parser = NonEmptyStringValueParser::new())]
    pub api_key: String,
    #[clap(long, env = "API_BASE_URL", default_value = "https://hiring.api.synthesia.io")]
    pub api_base_url: String,
    /// Signing call timeout in seconds.
    #[clap(long, env = "CLIENT_TIMEOUT", default_value = "2")]
    pub client_timeout: u64,

    #[clap(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,
    #[clap(long, env = "QUEUE_NAME", default_value = "sign-queue")]
    pub queue_name: String,
    #[clap(long, env = "QUEUE_WAIT_SECONDS", default_value = "10")]
    pub queue_wait_seconds: u64,
    #[clap(long, env = "QUEUE_VISIBILITY_SECONDS", default_value = "20")]
    pub queue_visibility_seconds: u64,

    #[clap(long, env = "RATE_LIMIT_CAPACITY", default_value = "10")]
    pub rate_limit_capacity: u64,
    #[clap(long, env = "RATE_LIMIT_REFILL_TOKENS", default_value = "10")]
    pub rate_limit_refill_tokens: u64,
    #[clap(long, env = "RATE_LIMIT_REFILL_SECONDS", default_value = "60")]
    pub rate_limit_refill_seconds: u64,

    /// Webhook call timeout in seconds.
    #[clap(long, env = "WEBHOOK_TIMEOUT", default_value = "2")]
    pub webhook_timeout: u64,
    /// Enables the callback signature headers. Empty means unset.
    #[clap(long, env = "WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    #[clap(long, env = "ASYNC_QUEUE_SIZE", default_value = "100")]
    pub async_queue_size: usize,
    #[clap(long, env = "PROCESSOR_POOL_SIZE", default_value = "10")]
    pub processor_pool_size: usize,
    #[clap(long, env = "WORKER_POLL_TIMEOUT", default_value = "10")]
    pub worker_poll_timeout: u64,
    #[clap(long, env = "SHUTDOWN_GRACE_SECONDS", default_value = "2")]
    pub shutdown_grace_seconds: u64,
}

impl From<WorkerArgs> for AppConfig {
    fn from(args: WorkerArgs) -> Self {
        let signer = SignerConfig::new(args.api_base_url, args.api_key)
            .with_timeout(Duration::from_secs(args.client_timeout));

        let queue = QueueConfig {
            queue_name: args.queue_name,
            wait_time: Duration::from_secs(args.queue_wait_seconds),
            visibility_timeout: Duration::from_secs(args.queue_visibility_seconds),
            ..QueueConfig::default()
        };

        let rate_limit = RateLimitConfig {
            capacity: args.rate_limit_capacity,
            refill_tokens: args.rate_limit_refill_tokens,
            refill_period: Duration::from_secs(args.rate_limit_refill_seconds),
            ..RateLimitConfig::default()
        };

        let mut webhook = WebhookConfig {
            timeout: Duration::from_secs(args.webhook_timeout),
            ..WebhookConfig::default()
        };
        if let Some(secret) = args.webhook_secret.filter(|secret| !secret.is_empty()) {
            webhook = webhook.with_secret(secret);
        }

        let pipeline = PipelineConfig {
            buffer_capacity: args.async_queue_size,
            worker_count: args.processor_pool_size,
            poll_timeout: Duration::from_secs(args.worker_poll_timeout),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_seconds),
            ..PipelineConfig::default()
        };

        Self {
            redis_url: args.redis_url,
            queue,
            rate_limit,
            signer,
            webhook,
            pipeline,
        }
    }
}
