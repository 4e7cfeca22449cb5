use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use tracing::{debug, error, warn};

use crate::config::SignerConfig;
use crate::rate_limit::RateLimiter;
use crate::telemetry::metric_inc;

/// Signs messages through the remote signing authority.
///
/// Never fails past its own boundary: rate limiting, remote errors and
/// transport failures all come back as `None`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, message: &str) -> Option<String>;
}

/// Counters describing why signing attempts did or did not produce a signature.
#[derive(Debug, Default)]
pub struct SigningStats {
    signed: AtomicU64,
    rate_limited: AtomicU64,
    remote_rate_limited: AtomicU64,
    remote_errors: AtomicU64,
    transport_errors: AtomicU64,
    limiter_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigningStatsSnapshot {
    pub signed: u64,
    /// Denied by the shared token bucket before any remote call.
    pub rate_limited: u64,
    /// Remote answered 429. Also counted in `remote_errors`.
    pub remote_rate_limited: u64,
    /// Any non-2xx remote answer.
    pub remote_errors: u64,
    /// Timeouts, connection failures and unreadable bodies.
    pub transport_errors: u64,
    /// The shared rate-limit store could not be reached.
    pub limiter_errors: u64,
}

impl SigningStats {
    pub fn snapshot(&self) -> SigningStatsSnapshot {
        SigningStatsSnapshot {
            signed: self.signed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            remote_rate_limited: self.remote_rate_limited.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            limiter_errors: self.limiter_errors.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64, metric: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metric_inc(metric);
    }
}

/// Rate-limited HTTP client for the signing authority.
///
/// Consults the shared token bucket first, then issues
/// `GET {base_url}/crypto/sign?message=..` with the API key in the
/// `Authorization` header.
pub struct HttpSigner {
    client: reqwest::Client,
    limiter: Arc<dyn RateLimiter>,
    sign_url: String,
    config: SignerConfig,
    stats: Arc<SigningStats>,
}

impl HttpSigner {
    pub fn new(config: SignerConfig, limiter: Arc<dyn RateLimiter>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            limiter,
            sign_url: format!("{}/crypto/sign", config.base_url.trim_end_matches('/')),
            config,
            stats: Arc::new(SigningStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<SigningStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl Signer for HttpSigner {
    async fn sign(&self, message: &str) -> Option<String> {
        match self.limiter.try_acquire().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("rate limit hit, not calling signing authority");
                SigningStats::inc(&self.stats.rate_limited, "signer.rate_limited");
                return None;
            }
            Err(err) => {
                error!(error = %err, "unable to consult rate limiter");
                SigningStats::inc(&self.stats.limiter_errors, "signer.limiter.error");
                return None;
            }
        }

        let response = self
            .client
            .get(&self.sign_url)
            .query(&[("message", message)])
            .header(AUTHORIZATION, self.config.api_key.expose_secret())
            .timeout(self.config.timeout)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, timeout = err.is_timeout(), "unable to sign message");
                SigningStats::inc(&self.stats.transport_errors, "signer.transport.error");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %body, "signing authority rejected request");
            SigningStats::inc(&self.stats.remote_errors, "signer.remote.error");
            if status == StatusCode::TOO_MANY_REQUESTS {
                SigningStats::inc(&self.stats.remote_rate_limited, "signer.remote.rate_limited");
            }
            return None;
        }

        match response.text().await {
            Ok(signature) => {
                SigningStats::inc(&self.stats.signed, "signer.sign.success");
                Some(signature)
            }
            Err(err) => {
                error!(error = %err, "unable to read signature body");
                SigningStats::inc(&self.stats.transport_errors, "signer.transport.error");
                None
            }
        }
    }
}
