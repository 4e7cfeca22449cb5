use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::queue::SigningQueue;
use crate::relay::relay_loop;
use crate::signer::Signer;
use crate::webhook::WebhookNotifier;
use crate::worker::{worker_loop, WorkerContext};

/// How [`Pipeline::shutdown`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every task finished within the grace period.
    Graceful,
    /// Some tasks were still busy and got aborted.
    Forced,
}

/// The asynchronous signing pipeline of one process.
///
/// One relay task feeds a bounded dispatch buffer; `worker_count` workers
/// drain it. The buffer is the only state shared between them and is
/// dropped with the pipeline; anything in it or in flight is redelivered by
/// the durable queue once its visibility window expires.
pub struct Pipeline {
    cancel: CancellationToken,
    relay_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Spawn the relay and the worker pool on the current tokio runtime.
    pub fn start(
        config: PipelineConfig,
        queue: Arc<dyn SigningQueue>,
        signer: Arc<dyn Signer>,
        notifier: Arc<dyn WebhookNotifier>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let shared_rx = Arc::new(Mutex::new(rx));

        let ctx = Arc::new(WorkerContext {
            signer,
            notifier,
            queue: queue.clone(),
            poll_timeout: config.poll_timeout,
        });

        let worker_count = config.worker_count.max(1);
        let worker_handles = (0..worker_count)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    shared_rx.clone(),
                    ctx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        let relay_handle = tokio::spawn(relay_loop(
            queue,
            tx,
            cancel.clone(),
            config.fetch_error_backoff,
        ));

        info!(
            workers = worker_count,
            buffer = config.buffer_capacity.max(1),
            "signing pipeline started"
        );

        Self {
            cancel,
            relay_handle: Some(relay_handle),
            worker_handles,
            config,
        }
    }

    /// Token that stops the pipeline when cancelled, e.g. from a signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the relay, let workers finish the item they hold for up to
    /// `shutdown_grace`, then abort whatever is still running.
    pub async fn shutdown(mut self) -> ShutdownOutcome {
        info!("shutting down signing pipeline");
        self.cancel.cancel();

        let deadline = Instant::now() + self.config.shutdown_grace;
        let mut handles: Vec<JoinHandle<()>> = self.relay_handle.take().into_iter().collect();
        handles.append(&mut self.worker_handles);

        // Handles before `pending` have completed and must not be polled again.
        let mut pending = handles.len();
        for (idx, handle) in handles.iter_mut().enumerate() {
            if timeout_at(deadline, handle).await.is_err() {
                pending = idx;
                break;
            }
        }

        let outcome = if pending < handles.len() {
            ShutdownOutcome::Forced
        } else {
            ShutdownOutcome::Graceful
        };

        if outcome == ShutdownOutcome::Forced {
            let unfinished = handles.split_off(pending);
            warn!(
                tasks = unfinished.len(),
                "grace period elapsed, aborting in-flight sign requests"
            );
            for handle in &unfinished {
                handle.abort();
            }
            for handle in unfinished {
                let _ = handle.await;
            }
        }

        info!(?outcome, "shutdown completed");
        outcome
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::QueueConfig;
    use crate::error::WebhookError;
    use crate::queue::InMemoryQueue;
    use crate::types::SignRequest;

    struct EchoSigner;

    #[async_trait]
    impl Signer for EchoSigner {
        async fn sign(&self, message: &str) -> Option<String> {
            Some(format!("signed:{message}"))
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WebhookNotifier for CountingNotifier {
        async fn notify(&self, _webhook_url: &str, _signed_message: &str) -> Result<bool, WebhookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    struct StuckNotifier;

    #[async_trait]
    impl WebhookNotifier for StuckNotifier {
        async fn notify(&self, _webhook_url: &str, _signed_message: &str) -> Result<bool, WebhookError> {
            futures::future::pending().await
        }
    }

    fn fast_queue() -> Arc<InMemoryQueue> {
        Arc::new(InMemoryQueue::new(QueueConfig {
            wait_time: Duration::from_millis(20),
            ..QueueConfig::default()
        }))
    }

    fn config(workers: usize) -> PipelineConfig {
        PipelineConfig {
            buffer_capacity: 4,
            worker_count: workers,
            poll_timeout: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(200),
            fetch_error_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drains_queue_and_shuts_down_gracefully() {
        let queue = fast_queue();
        for i in 0..25 {
            queue
                .schedule(&SignRequest::new(format!("m{i}"), "https://example.com/cb"))
                .await
                .unwrap();
        }
        let notifier = Arc::new(CountingNotifier::default());

        let pipeline = Pipeline::start(config(3), queue.clone(), Arc::new(EchoSigner), notifier.clone());
        assert!(!pipeline.cancellation_token().is_cancelled());

        tokio::time::timeout(Duration::from_secs(5), async {
            while notifier.calls.load(Ordering::SeqCst) < 25 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all messages should be delivered");

        assert_eq!(pipeline.shutdown().await, ShutdownOutcome::Graceful);
        assert_eq!(queue.ready_len().await, 0);
        assert_eq!(queue.in_flight_len().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stuck_worker_is_aborted_after_grace_period() {
        let queue = fast_queue();
        queue
            .schedule(&SignRequest::new("hello", "https://example.com/cb"))
            .await
            .unwrap();

        let pipeline = Pipeline::start(config(1), queue.clone(), Arc::new(EchoSigner), Arc::new(StuckNotifier));

        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.in_flight_len().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message should be picked up");

        assert_eq!(pipeline.shutdown().await, ShutdownOutcome::Forced);
        // Never acknowledged, so it is still owed a redelivery.
        assert_eq!(queue.in_flight_len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forced_shutdown_with_idle_workers_alongside_a_stuck_one() {
        let queue = fast_queue();
        queue
            .schedule(&SignRequest::new("hello", "https://example.com/cb"))
            .await
            .unwrap();

        let pipeline = Pipeline::start(config(4), queue.clone(), Arc::new(EchoSigner), Arc::new(StuckNotifier));

        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.in_flight_len().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message should be picked up");

        let outcome = tokio::time::timeout(Duration::from_secs(2), pipeline.shutdown())
            .await
            .expect("shutdown should return after the grace period");
        assert_eq!(outcome, ShutdownOutcome::Forced);
        assert_eq!(queue.in_flight_len().await, 1);
    }
}
