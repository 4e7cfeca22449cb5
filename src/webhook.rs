use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use url::Url;

use crate::callback_signature::{build_callback_headers, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::config::WebhookConfig;
use crate::error::WebhookError;

/// Query parameter carrying the signature on the callback.
pub const SIGNED_MESSAGE_PARAM: &str = "signedMessage";

/// Delivers signed results to caller-supplied URLs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookNotifier: Send + Sync {
    /// `Ok(true)` iff the endpoint answered with a status below 300.
    /// Callers treat `Err` exactly like `Ok(false)`.
    async fn notify(&self, webhook_url: &str, signed_message: &str) -> Result<bool, WebhookError>;
}

pub struct HttpWebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl HttpWebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn callback_url(webhook_url: &str, signed_message: &str) -> Result<Url, WebhookError> {
        let mut url = Url::parse(webhook_url).map_err(|source| WebhookError::InvalidUrl {
            url: webhook_url.to_string(),
            source,
        })?;
        url.query_pairs_mut()
            .append_pair(SIGNED_MESSAGE_PARAM, signed_message);
        Ok(url)
    }

    fn secret(&self) -> Option<&SecretString> {
        self.config.secret.as_ref()
    }
}

#[async_trait]
impl WebhookNotifier for HttpWebhookNotifier {
    async fn notify(&self, webhook_url: &str, signed_message: &str) -> Result<bool, WebhookError> {
        let url = Self::callback_url(webhook_url, signed_message)?;

        let mut request = self.client.get(url).timeout(self.config.timeout);
        if let Some(secret) = self.secret() {
            let headers = build_callback_headers(secret.expose_secret().as_bytes(), signed_message);
            request = request
                .header(SIGNATURE_HEADER, headers.signature)
                .header(TIMESTAMP_HEADER, headers.timestamp);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(status = status.as_u16(), "webhook answered");

        Ok(status.as_u16() < 300)
    }
}
