use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::SigningQueue;
use crate::signer::Signer;
use crate::telemetry::metric_inc;
use crate::types::SignRequest;
use crate::webhook::WebhookNotifier;

/// Shared, read-only context for all workers.
pub struct WorkerContext {
    pub signer: Arc<dyn Signer>,
    pub notifier: Arc<dyn WebhookNotifier>,
    pub queue: Arc<dyn SigningQueue>,

    /// Bounded wait on an empty dispatch buffer.
    pub poll_timeout: Duration,
}

/// What happened to one item taken from the dispatch buffer.
///
/// Only `Acknowledged` removes the delivery from the durable queue; every
/// other outcome leaves it to reappear after its visibility window, except
/// `MissingReceipt`, which is dropped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Acknowledged,
    MissingReceipt,
    NotSigned,
    WebhookRejected,
    WebhookFailed,
    AcknowledgeFailed,
}

/// Shared receiving end of the dispatch buffer.
pub type DispatchReceiver = Arc<Mutex<mpsc::Receiver<SignRequest>>>;

enum Take {
    Item(SignRequest),
    Idle,
    Closed,
}

/// Main worker loop.
///
/// Each worker:
/// - Takes one request from the dispatch buffer, waiting at most `poll_timeout`
/// - Signs it, notifies the webhook, then acknowledges, each step gating the next
/// - Survives any failure or panic of a single item
/// - Stops between items once `cancel` fires or the buffer is closed
pub async fn worker_loop(
    worker: usize,
    rx: DispatchReceiver,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
) {
    info!(worker, "signing worker started");

    loop {
        let take = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            take = take_next(&rx, ctx.poll_timeout) => take,
        };

        let request = match take {
            Take::Item(request) => request,
            Take::Idle => continue,
            Take::Closed => break,
        };

        match AssertUnwindSafe(process_request(request, &ctx)).catch_unwind().await {
            Ok(outcome) => debug!(worker, ?outcome, "sign request handled"),
            Err(_) => {
                metric_inc("pipeline.abandoned");
                error!(worker, "panic while processing sign request, abandoning it");
            }
        }
    }

    info!(worker, "signing worker stopped");
}

async fn take_next(rx: &DispatchReceiver, poll_timeout: Duration) -> Take {
    let mut guard = rx.lock().await;
    match tokio::time::timeout(poll_timeout, guard.recv()).await {
        Ok(Some(request)) => Take::Item(request),
        Ok(None) => Take::Closed,
        Err(_) => Take::Idle,
    }
}

/// Run sign, notify and acknowledge for one delivery.
pub async fn process_request(request: SignRequest, ctx: &WorkerContext) -> ProcessOutcome {
    let Some(receipt) = request.receipt_handle.clone() else {
        metric_inc("pipeline.missing_receipt");
        error!("missing receipt handle on sign request, discarding it");
        return ProcessOutcome::MissingReceipt;
    };

    let Some(signature) = ctx.signer.sign(&request.message).await else {
        metric_inc("pipeline.abandoned");
        debug!(%receipt, "no signature, leaving delivery for redelivery");
        return ProcessOutcome::NotSigned;
    };

    let notified = AssertUnwindSafe(ctx.notifier.notify(&request.webhook_url, &signature))
        .catch_unwind()
        .await;
    match notified {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            metric_inc("pipeline.abandoned");
            warn!(%receipt, "webhook rejected signed message");
            return ProcessOutcome::WebhookRejected;
        }
        Ok(Err(err)) => {
            metric_inc("pipeline.abandoned");
            warn!(%receipt, error = %err, "webhook notification failed");
            return ProcessOutcome::WebhookFailed;
        }
        Err(_) => {
            metric_inc("pipeline.abandoned");
            error!(%receipt, "webhook notifier panicked");
            return ProcessOutcome::WebhookFailed;
        }
    }

    match ctx.queue.acknowledge(&request).await {
        Ok(()) => {
            metric_inc("pipeline.acknowledged");
            info!(%receipt, "sign request processed successfully");
            ProcessOutcome::Acknowledged
        }
        Err(err) => {
            error!(%receipt, error = %err, "unable to acknowledge delivery");
            ProcessOutcome::AcknowledgeFailed
        }
    }
}
