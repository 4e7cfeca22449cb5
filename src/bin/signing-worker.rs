use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use redis::aio::ConnectionManager;
use tracing::{error, info};

use sign_pipeline::{
    init_tracing,
    AppConfig,
    HttpSigner,
    HttpWebhookNotifier,
    Pipeline,
    RedisQueue,
    RedisTokenBucket,
    WorkerArgs,
};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing("info");
    let config = AppConfig::from(WorkerArgs::parse());

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "signing worker failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = ConnectionManager::new(client).await?;
    info!(redis = %config.redis_url, queue = %config.queue.queue_name, "connected to redis");

    let limiter = Arc::new(RedisTokenBucket::new(conn.clone(), config.rate_limit.clone()));
    let signer = Arc::new(HttpSigner::new(config.signer.clone(), limiter)?);
    let notifier = Arc::new(HttpWebhookNotifier::new(config.webhook.clone())?);
    let queue = Arc::new(RedisQueue::new(conn, config.queue.clone()));

    let stats = signer.stats();
    let pipeline = Pipeline::start(config.pipeline.clone(), queue, signer, notifier);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let outcome = pipeline.shutdown().await;
    info!(?outcome, stats = ?stats.snapshot(), "signing worker exiting");
    Ok(())
}
