use anyhow::{Error, Result, anyhow};
use reqwest::StatusCode;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::{
    batch::BatchIngestor,
    dispatcher::MessageDispatcher,
    models::{
        message::{Envelope, Task},
        retry::RetryConfig,
    },
};

/// Runs one queued task. `Err` means the delivery should be dead-lettered;
/// per-channel send failures are already recorded on the message and do not
/// surface here.
pub async fn process_task(
    payload: &[u8],
    dispatcher: &MessageDispatcher,
    ingestor: &BatchIngestor,
) -> Result<(), Error> {
    let envelope = serde_json::from_slice::<Envelope>(payload)?;

    match envelope.task {
        Task::Dispatch(request) => {
            info!(
                trace_id = %envelope.trace_id,
                template = %request.template_name,
                "Processing dispatch task"
            );

            let message = dispatcher
                .dispatch(request)
                .await
                .map_err(|e| anyhow!("Dispatch failed: {}", e))?;

            info!(trace_id = %envelope.trace_id, message_id = %message.id, "Dispatch task completed");
            Ok(())
        }
        Task::ExpandBatch { batch_id } => {
            info!(trace_id = %envelope.trace_id, %batch_id, "Processing batch expansion task");

            match ingestor
                .expand_batch(batch_id)
                .await
                .map_err(|e| anyhow!("Batch expansion failed: {}", e))?
            {
                Some(batch) => info!(
                    %batch_id,
                    messages = batch.message_ids.len(),
                    row_errors = batch.row_errors.len(),
                    "Batch expansion task completed"
                ),
                None => debug!(%batch_id, "Batch already taken by another worker"),
            }
            Ok(())
        }
    }
}

/// Server errors and throttling are transient; every other failure status is
/// the provider rejecting the request.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(attempt, max_attempts = config.max_attempts, "Retry succeeded");
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                debug!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms,
                    error = %e,
                    "Attempt failed, backing off"
                );

                let jitter = rand::random_range(-0.1..=0.1);
                let jittered_delay = (delay_ms as f64 * (1.0 + jitter)) as u64;

                sleep(Duration::from_millis(jittered_delay)).await;

                delay_ms = std::cmp::min(
                    delay_ms.saturating_mul(config.backoff_multiplier),
                    config.max_delay_ms,
                );
            }
        }
    }
}
