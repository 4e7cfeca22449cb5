use std::sync::Arc;

use tracing::debug;

use crate::error::{EnqueueError, ServiceError};
use crate::queue::SigningQueue;
use crate::signer::Signer;
use crate::types::SignRequest;

/// Result of a signing request as seen by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutcome {
    /// Signed synchronously; the signature is returned to the caller.
    Signed(String),
    /// Accepted for asynchronous signing; the signature arrives at the webhook.
    Scheduled,
}

/// Entry point used by request handlers.
///
/// Tries to sign right away and falls back to the durable queue when the
/// signing client declines (rate limit or remote failure).
pub struct SigningService {
    signer: Arc<dyn Signer>,
    queue: Arc<dyn SigningQueue>,
}

impl SigningService {
    pub fn new(signer: Arc<dyn Signer>, queue: Arc<dyn SigningQueue>) -> Self {
        Self { signer, queue }
    }

    pub async fn sign(&self, message: &str) -> Option<String> {
        self.signer.sign(message).await
    }

    pub async fn schedule_message_signing(&self, request: &SignRequest) -> Result<(), EnqueueError> {
        self.queue.schedule(request).await
    }

    pub async fn sign_or_schedule(&self, request: SignRequest) -> Result<SignOutcome, ServiceError> {
        request.validate()?;

        if let Some(signature) = self.sign(&request.message).await {
            return Ok(SignOutcome::Signed(signature));
        }

        debug!("synchronous signing declined, scheduling for asynchronous signing");
        self.schedule_message_signing(&request).await?;
        Ok(SignOutcome::Scheduled)
    }
}
