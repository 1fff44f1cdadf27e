use anyhow::{Error, Result, anyhow};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tracing::{debug, info};

use crate::models::message::{DeadLetter, Envelope};

pub struct RabbitMqClient {
    channel: Channel,
    task_queue_name: String,
    failed_queue_name: String,
}

impl RabbitMqClient {
    pub async fn connect(
        rabbitmq_url: &str,
        task_queue_name: &str,
        failed_queue_name: &str,
        prefetch_count: u16,
    ) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|_| anyhow!("RabbitMQ channel creation failed"))?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to set up QoS"))?;

        for queue in [task_queue_name, failed_queue_name] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|_| anyhow!("Failed to declare queue {}", queue))?;
            debug!(queue, "Queue declared");
        }

        info!(
            task_queue = task_queue_name,
            failed_queue = failed_queue_name,
            prefetch_count,
            "RabbitMQ connection established"
        );

        Ok(Self {
            channel,
            task_queue_name: task_queue_name.to_string(),
            failed_queue_name: failed_queue_name.to_string(),
        })
    }

    pub async fn publish_task(&self, envelope: &Envelope) -> Result<(), Error> {
        self.publish(&self.task_queue_name, &serde_json::to_vec(envelope)?)
            .await
            .map_err(|_| anyhow!("Failed to publish task"))?;

        debug!(trace_id = %envelope.trace_id, "Task published");
        Ok(())
    }

    pub async fn create_consumer(&self, consumer_tag: &str) -> Result<Consumer, Error> {
        let consumer = self
            .channel
            .basic_consume(
                &self.task_queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|_| anyhow!("Failed to create consumer"))?;

        info!(queue = %self.task_queue_name, consumer_tag, "Consumer created");

        Ok(consumer)
    }

    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|_| anyhow!("Failed to acknowledge message"))?;

        Ok(())
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|_| anyhow!("Failed to reject message"))?;

        Ok(())
    }

    pub async fn publish_to_dlq(&self, dead_letter: &DeadLetter) -> Result<(), Error> {
        self.publish(&self.failed_queue_name, &serde_json::to_vec(dead_letter)?)
            .await
            .map_err(|_| anyhow!("Failed to publish message to dlq"))?;

        Ok(())
    }

    /// Passive declare: fails when the broker or the queue is gone.
    pub async fn health_check(&self) -> Result<(), Error> {
        self.channel
            .queue_declare(
                &self.task_queue_name,
                QueueDeclareOptions {
                    passive: true,
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("RabbitMQ health check failed: {}", e))?;

        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), lapin::Error> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?;

        Ok(())
    }
}
