use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{AcknowledgeError, EnqueueError, FetchError};
use crate::telemetry::metric_inc;
use crate::types::{ReceiptHandle, SignRequest};

/// Upper bound on deliveries returned by one `fetch_batch` call.
pub const MAX_BATCH_SIZE: usize = 10;

/// At-least-once durable queue of sign requests.
///
/// Fetched deliveries stay hidden from other consumers for a visibility
/// window and reappear if they are not acknowledged in time. That window
/// is the only retry mechanism of the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SigningQueue: Send + Sync {
    /// Enqueue the wire body (`message` + `webhookUrl`) of a request.
    async fn schedule(&self, request: &SignRequest) -> Result<(), EnqueueError>;

    /// Long-poll for up to [`MAX_BATCH_SIZE`] deliveries.
    ///
    /// Returns an empty batch when nothing arrived within the wait interval.
    /// Every returned request carries its receipt handle. Bodies that fail
    /// to decode are logged and skipped.
    async fn fetch_batch(&self) -> Result<Vec<SignRequest>, FetchError>;

    /// Delete the delivery identified by the request's receipt handle.
    async fn acknowledge(&self, request: &SignRequest) -> Result<(), AcknowledgeError>;
}

/// Decode a fetched body, logging and dropping it when malformed.
pub(crate) fn decode_delivery(body: &str, receipt: ReceiptHandle) -> Option<SignRequest> {
    trace!(body, "received message");
    match SignRequest::from_wire(body, receipt) {
        Ok(request) => Some(request),
        Err(err) => {
            metric_inc("queue.malformed_body");
            error!(error = %err, "couldn't deserialize queued sign request, skipping");
            None
        }
    }
}

struct InFlight {
    body: String,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    in_flight: HashMap<ReceiptHandle, InFlight>,
}

impl QueueState {
    /// Move expired deliveries back to the front of the ready queue.
    fn release_expired(&mut self, now: Instant) {
        let expired: Vec<ReceiptHandle> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(entry) = self.in_flight.remove(&receipt) {
                debug!(%receipt, "visibility window expired, message is visible again");
                self.ready.push_front(entry.body);
            }
        }
    }

    fn take(&mut self, max: usize, visibility: Duration, now: Instant) -> Vec<(ReceiptHandle, String)> {
        let mut taken = Vec::new();
        while taken.len() < max {
            let Some(body) = self.ready.pop_front() else { break };
            let receipt = ReceiptHandle(Uuid::new_v4().to_string());
            self.in_flight.insert(
                receipt.clone(),
                InFlight {
                    body: body.clone(),
                    visible_at: now + visibility,
                },
            );
            taken.push((receipt, body));
        }
        taken
    }
}

/// Process-local durable queue with the same visibility semantics as the
/// Redis binding.
///
/// Suitable for a single-process deployment and for exercising the relay
/// and worker pool without any network dependency. Contents are lost on
/// process exit.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
        }
    }

    /// Enqueue a raw body without serialization, e.g. a malformed one.
    pub async fn push_raw(&self, body: impl Into<String>) {
        self.state.lock().await.ready.push_back(body.into());
        self.notify.notify_one();
    }

    /// Messages currently visible to `fetch_batch`.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Deliveries fetched but neither acknowledged nor expired.
    pub async fn in_flight_len(&self) -> usize {
        let mut state = self.state.lock().await;
        state.release_expired(Instant::now());
        state.in_flight.len()
    }

    async fn try_take(&self) -> Vec<(ReceiptHandle, String)> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.release_expired(now);
        state.take(self.config.batch_size(), self.config.visibility_timeout, now)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl SigningQueue for InMemoryQueue {
    async fn schedule(&self, request: &SignRequest) -> Result<(), EnqueueError> {
        let body = request.to_wire()?;
        trace!(%body, "sending message");
        self.push_raw(body).await;
        Ok(())
    }

    async fn fetch_batch(&self) -> Result<Vec<SignRequest>, FetchError> {
        let deadline = Instant::now() + self.config.wait_time;

        loop {
            let taken = self.try_take().await;
            if !taken.is_empty() {
                return Ok(taken
                    .into_iter()
                    .filter_map(|(receipt, body)| decode_delivery(&body, receipt))
                    .collect());
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            // Wake on a new message or when the earliest in-flight delivery could expire.
            let wake_at = {
                let state = self.state.lock().await;
                state
                    .in_flight
                    .values()
                    .map(|entry| entry.visible_at)
                    .min()
                    .map_or(deadline, |visible_at| visible_at.min(deadline))
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, request: &SignRequest) -> Result<(), AcknowledgeError> {
        let receipt = request
            .receipt_handle
            .as_ref()
            .ok_or(AcknowledgeError::MissingReceipt)?;

        let mut state = self.state.lock().await;
        state.release_expired(Instant::now());

        match state.in_flight.remove(receipt) {
            Some(_) => {
                debug!(%receipt, "deleted message");
                Ok(())
            }
            None => Err(AcknowledgeError::InvalidReceipt {
                receipt: receipt.to_string(),
            }),
        }
    }
}
