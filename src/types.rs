use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ValidationError;

/// A request to sign `message` and deliver the signature to `webhook_url`.
///
/// The same type travels through every stage of the pipeline. Only
/// `message` and `webhook_url` are part of the wire body placed on the
/// durable queue; the receipt handle is attached by the queue binding when
/// a delivery is fetched and identifies that delivery, not the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    /// Payload to be signed.
    pub message: String,

    /// Absolute URL that receives the signed result.
    pub webhook_url: String,

    /// Present only once the request has been fetched from the durable queue.
    #[serde(skip)]
    pub receipt_handle: Option<ReceiptHandle>,
}

impl SignRequest {
    /// Create a request that has not been fetched from a queue yet.
    pub fn new(message: impl Into<String>, webhook_url: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            webhook_url: webhook_url.into(),
            receipt_handle: None,
        }
    }

    /// Attach the receipt handle of a specific delivery.
    pub fn with_receipt_handle(mut self, receipt_handle: impl Into<String>) -> Self {
        self.receipt_handle = Some(ReceiptHandle(receipt_handle.into()));
        self
    }

    /// Check the request before it is accepted for signing.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }

        let url = Url::parse(&self.webhook_url).map_err(|_| ValidationError::InvalidWebhookUrl {
            url: self.webhook_url.clone(),
        })?;

        match url.scheme() {
            "http" | "https" if url.has_host() => Ok(()),
            _ => Err(ValidationError::InvalidWebhookUrl {
                url: self.webhook_url.clone(),
            }),
        }
    }

    /// Serialize the queue body. The receipt handle is never included.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a queue body and bind it to the delivery it arrived with.
    pub fn from_wire(body: &str, receipt_handle: ReceiptHandle) -> Result<Self, serde_json::Error> {
        let mut request: SignRequest = serde_json::from_str(body)?;
        request.receipt_handle = Some(receipt_handle);
        Ok(request)
    }
}

/// Opaque token identifying one delivery of a queued request.
///
/// Required to acknowledge (delete) that delivery. A new handle is minted
/// every time the message is fetched, so a handle from an expired delivery
/// is no longer accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
