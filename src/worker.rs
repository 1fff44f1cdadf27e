use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use chrono::Utc;
use futures_util::StreamExt;
use tokio::{sync::Semaphore, time::interval};
use tracing::{debug, error, info, warn};

use crate::{
    batch::BatchIngestor,
    clients::rbmq::RabbitMqClient,
    dispatcher::MessageDispatcher,
    models::message::{DeadLetter, Envelope, Task},
    utils::process_task,
};

/// Consumes the task queue, running at most `concurrency` tasks at once.
pub struct TaskWorker {
    rabbitmq: Arc<RabbitMqClient>,
    dispatcher: Arc<MessageDispatcher>,
    ingestor: Arc<BatchIngestor>,
    concurrency: usize,
}

impl TaskWorker {
    pub fn new(
        rabbitmq: Arc<RabbitMqClient>,
        dispatcher: Arc<MessageDispatcher>,
        ingestor: Arc<BatchIngestor>,
        concurrency: usize,
    ) -> Self {
        Self {
            rabbitmq,
            dispatcher,
            ingestor,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(self) -> Result<(), Error> {
        let mut consumer = self.rabbitmq.create_consumer("dispatch_worker").await?;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        info!(concurrency = self.concurrency, "Task worker started");

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(error = %e, "Failed to receive delivery");
                    continue;
                }
            };

            let permit = semaphore.clone().acquire_owned().await?;
            let rabbitmq = self.rabbitmq.clone();
            let dispatcher = self.dispatcher.clone();
            let ingestor = self.ingestor.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let tag = delivery.delivery_tag;

                match process_task(&delivery.data, &dispatcher, &ingestor).await {
                    Ok(()) => {
                        if let Err(e) = rabbitmq.acknowledge(tag).await {
                            error!(error = %e, delivery_tag = tag, "Failed to acknowledge task");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, delivery_tag = tag, "Task failed, routing to dead letter queue");

                        if dead_letter(&rabbitmq, &delivery.data, e.to_string()).await {
                            if let Err(e) = rabbitmq.acknowledge(tag).await {
                                error!(error = %e, delivery_tag = tag, "Failed to acknowledge task");
                            }
                        } else if let Err(e) = rabbitmq.reject(tag, false).await {
                            error!(error = %e, delivery_tag = tag, "Failed to reject task");
                        }
                    }
                }
            });
        }

        warn!("Task consumer stream ended");
        Ok(())
    }
}

/// Returns `true` once the failed task is safely on the failed queue.
async fn dead_letter(rabbitmq: &RabbitMqClient, payload: &[u8], failure_reason: String) -> bool {
    let Ok(original) = serde_json::from_slice::<Envelope>(payload) else {
        error!(failure_reason, "Dropping undecodable task");
        return false;
    };

    let dead_letter = DeadLetter {
        original,
        failure_reason,
        failed_at: Utc::now(),
    };

    match rabbitmq.publish_to_dlq(&dead_letter).await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Failed to publish dead letter");
            false
        }
    }
}

/// Periodically starts batches whose `send_at` has passed. With a task
/// queue the expansion is handed to the workers; without one it runs here.
pub struct BatchScheduler {
    ingestor: Arc<BatchIngestor>,
    rabbitmq: Option<Arc<RabbitMqClient>>,
    poll_interval: Duration,
}

impl BatchScheduler {
    pub fn new(
        ingestor: Arc<BatchIngestor>,
        rabbitmq: Option<Arc<RabbitMqClient>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ingestor,
            rabbitmq,
            poll_interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.poll_interval);
        info!(poll_interval = ?self.poll_interval, "Batch scheduler started");

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Batch scheduler pass failed");
            }
        }
    }

    /// One scheduling pass. Returns how many due batches were handed off.
    pub async fn run_once(&self) -> Result<usize, Error> {
        let due = self.ingestor.due_batches().await?;
        if due.is_empty() {
            return Ok(0);
        }

        debug!(count = due.len(), "Due batches found");

        for batch_id in &due {
            match &self.rabbitmq {
                Some(rabbitmq) => {
                    rabbitmq
                        .publish_task(&Envelope::new(Task::ExpandBatch { batch_id: *batch_id }))
                        .await?;
                }
                None => {
                    if let Err(e) = self.ingestor.expand_batch(*batch_id).await {
                        error!(%batch_id, error = %e, "Batch expansion failed");
                    }
                }
            }
        }

        Ok(due.len())
    }
}
