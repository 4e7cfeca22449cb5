use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::FetchError;
use crate::queue::SigningQueue;
use crate::telemetry::metric_inc;
use crate::types::SignRequest;

/// Moves deliveries from the durable queue into the dispatch buffer.
///
/// Loops until `cancel` fires or every worker is gone:
/// - fetches a batch (long-poll)
/// - hands each item to the buffer in order, waiting while it is full
/// - logs fetch failures and panics, sleeps `error_backoff`, and carries on
///
/// Items not yet handed over when cancellation arrives stay on the durable
/// queue and reappear after their visibility window.
pub async fn relay_loop(
    queue: Arc<dyn SigningQueue>,
    tx: mpsc::Sender<SignRequest>,
    cancel: CancellationToken,
    error_backoff: Duration,
) {
    info!("queue relay started");

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fetched = fetch(queue.as_ref()) => fetched,
        };

        let batch = match fetched {
            Ok(batch) => batch,
            Err(err) => {
                metric_inc("relay.fetch.error");
                error!(error = %err, "encountered an error while pulling from queue");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(error_backoff) => continue,
                }
            }
        };

        if !batch.is_empty() {
            debug!(count = batch.len(), "relaying batch");
        }

        for request in batch {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("queue relay stopped");
                    return;
                }
                sent = tx.send(request) => sent,
            };

            if sent.is_err() {
                info!("dispatch buffer closed, queue relay stopped");
                return;
            }
        }
    }

    info!("queue relay stopped");
}

async fn fetch(queue: &dyn SigningQueue) -> Result<Vec<SignRequest>, FetchFailure> {
    match AssertUnwindSafe(queue.fetch_batch()).catch_unwind().await {
        Ok(Ok(batch)) => Ok(batch),
        Ok(Err(err)) => Err(FetchFailure::Queue(err)),
        Err(_) => Err(FetchFailure::Panicked),
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchFailure {
    #[error(transparent)]
    Queue(FetchError),

    #[error("fetch_batch panicked")]
    Panicked,
}
