use std::sync::Arc;
use std::time::Duration;

use sign_pipeline::{
    HttpSigner, HttpWebhookNotifier, InMemoryQueue, Pipeline, PipelineConfig, QueueConfig,
    ShutdownOutcome, SignOutcome, SignRequest, SignerConfig, SigningQueue, SigningService,
    TokenBucket, WebhookConfig, MAX_BATCH_SIZE,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn queue() -> Arc<InMemoryQueue> {
    Arc::new(InMemoryQueue::new(QueueConfig {
        wait_time: Duration::from_millis(20),
        visibility_timeout: Duration::from_secs(30),
        ..QueueConfig::default()
    }))
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        buffer_capacity: 8,
        worker_count: 2,
        poll_timeout: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(1),
        fetch_error_backoff: Duration::from_millis(10),
    }
}

fn signer(server: &MockServer, bucket: TokenBucket) -> Arc<HttpSigner> {
    let config = SignerConfig::new(server.uri(), "api-key").with_timeout(Duration::from_millis(500));
    Arc::new(HttpSigner::new(config, Arc::new(bucket)).unwrap())
}

fn notifier() -> Arc<HttpWebhookNotifier> {
    Arc::new(HttpWebhookNotifier::new(WebhookConfig::default()).unwrap())
}

fn generous_bucket() -> TokenBucket {
    TokenBucket::new(100, 100, Duration::from_secs(60))
}

async fn wait_for_requests(server: &MockServer, path_prefix: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let seen = server
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .filter(|r| r.url.path().starts_with(path_prefix))
                .count();
            if seen >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("expected requests did not arrive");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_message_is_signed_delivered_and_acknowledged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/crypto/sign"))
        .and(query_param("message", "hello"))
        .respond_with(ResponseTemplate::new(200).set_body_string("SIGNATURE123"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cb"))
        .and(query_param("signedMessage", "SIGNATURE123"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let queue = queue();
    queue
        .schedule(&SignRequest::new("hello", format!("{}/cb", server.uri())))
        .await
        .unwrap();

    let signer = signer(&server, generous_bucket());
    let stats = signer.stats();
    let pipeline = Pipeline::start(pipeline_config(), queue.clone(), signer, notifier());

    wait_for_requests(&server, "/cb", 1).await;

    assert_eq!(pipeline.shutdown().await, ShutdownOutcome::Graceful);
    assert_eq!(queue.ready_len().await, 0);
    assert_eq!(queue.in_flight_len().await, 0);
    assert_eq!(stats.snapshot().signed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_signing_leaves_message_unacknowledged_and_skips_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/crypto/sign"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let queue = queue();
    queue
        .schedule(&SignRequest::new("hello", format!("{}/cb", server.uri())))
        .await
        .unwrap();

    let signer = signer(&server, generous_bucket());
    let stats = signer.stats();
    let pipeline = Pipeline::start(pipeline_config(), queue.clone(), signer, notifier());

    wait_for_requests(&server, "/crypto/sign", 1).await;
    pipeline.shutdown().await;

    assert_eq!(queue.in_flight_len().await, 1);
    assert_eq!(stats.snapshot().remote_errors, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_webhook_leaves_message_unacknowledged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/crypto/sign"))
        .respond_with(ResponseTemplate::new(200).set_body_string("SIG"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let queue = queue();
    queue
        .schedule(&SignRequest::new("hello", format!("{}/cb", server.uri())))
        .await
        .unwrap();

    let pipeline = Pipeline::start(
        pipeline_config(),
        queue.clone(),
        signer(&server, generous_bucket()),
        notifier(),
    );

    wait_for_requests(&server, "/cb", 1).await;
    pipeline.shutdown().await;

    assert_eq!(queue.in_flight_len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_bucket_caps_signing_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/crypto/sign"))
        .respond_with(ResponseTemplate::new(200).set_body_string("SIG"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let queue = queue();
    for i in 0..5 {
        queue
            .schedule(&SignRequest::new(format!("m{i}"), format!("{}/cb", server.uri())))
            .await
            .unwrap();
    }

    let signer = signer(&server, TokenBucket::new(2, 2, Duration::from_secs(3600)));
    let stats = signer.stats();
    let pipeline = Pipeline::start(pipeline_config(), queue.clone(), signer, notifier());

    tokio::time::timeout(Duration::from_secs(5), async {
        while stats.snapshot().rate_limited < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("remaining messages should hit the rate limit");
    pipeline.shutdown().await;

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.signed, 2);
    assert_eq!(snapshot.rate_limited, 3);
    assert_eq!(queue.in_flight_len().await, 3);
}

#[tokio::test]
async fn twenty_scheduled_messages_are_fetched_at_most_ten_at_a_time() {
    let queue = queue();
    for i in 0..20 {
        queue
            .schedule(&SignRequest::new(format!("m{i}"), "https://example.com/cb"))
            .await
            .unwrap();
    }

    let mut batches = Vec::new();
    loop {
        let batch = queue.fetch_batch().await.unwrap();
        if batch.is_empty() {
            break;
        }
        batches.push(batch.len());
    }

    assert_eq!(batches, vec![MAX_BATCH_SIZE, MAX_BATCH_SIZE]);
}

#[tokio::test]
async fn service_falls_back_to_queue_when_signer_declines() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/crypto/sign"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let queue = queue();
    let signer = signer(&server, generous_bucket());
    let stats = signer.stats();
    let service = SigningService::new(signer, queue.clone());

    let outcome = service
        .sign_or_schedule(SignRequest::new("hello", "https://example.com/cb"))
        .await
        .unwrap();

    assert_eq!(outcome, SignOutcome::Scheduled);
    assert_eq!(stats.snapshot().remote_rate_limited, 1);

    let batch = queue.fetch_batch().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message, "hello");
    assert_eq!(batch[0].webhook_url, "https://example.com/cb");
}
