use std::{future::Future, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::{sync::Mutex, time::timeout};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{
        batch::{MessageBatch, RowError},
        message::{Channel, ChannelRecord, Message, Recipient},
        status::{BatchStatus, MessageStatus},
        template::{Template, TemplateVariant, VariantKey},
    },
    store::{BatchRepository, ChannelUpdate, MessageStore, TemplateRepository},
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id UUID PRIMARY KEY,
    batch_id UUID,
    batch_row INTEGER,
    template_name TEXT NOT NULL,
    template_name_lower TEXT NOT NULL,
    language TEXT NOT NULL,
    treatment TEXT NOT NULL,
    recipient JSONB NOT NULL,
    sms_delivery JSONB,
    email_delivery JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
ALTER TABLE messages ADD COLUMN IF NOT EXISTS batch_row INTEGER;
CREATE INDEX IF NOT EXISTS idx_messages_sms_provider_id ON messages ((sms_delivery->>'provider_message_id'));
CREATE INDEX IF NOT EXISTS idx_messages_email_provider_id ON messages ((email_delivery->>'provider_message_id'));
CREATE INDEX IF NOT EXISTS idx_messages_sms_fingerprint ON messages ((sms_delivery->>'fingerprint'), created_at);
CREATE INDEX IF NOT EXISTS idx_messages_email_fingerprint ON messages ((email_delivery->>'fingerprint'), created_at);
CREATE INDEX IF NOT EXISTS idx_messages_variant ON messages (template_name_lower, language, treatment);
CREATE INDEX IF NOT EXISTS idx_messages_batch_row ON messages (batch_id, batch_row);

CREATE TABLE IF NOT EXISTS templates (
    name_lower TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS template_variants (
    template_name_lower TEXT NOT NULL REFERENCES templates (name_lower) ON DELETE CASCADE,
    language TEXT NOT NULL,
    treatment TEXT NOT NULL,
    email_subject TEXT NOT NULL,
    email_body TEXT NOT NULL,
    sms_body TEXT NOT NULL,
    PRIMARY KEY (template_name_lower, language, treatment)
);

CREATE TABLE IF NOT EXISTS batches (
    id UUID PRIMARY KEY,
    template_name TEXT NOT NULL,
    recipients TEXT NOT NULL,
    send_at TIMESTAMPTZ,
    status TEXT NOT NULL,
    message_ids JSONB NOT NULL,
    row_errors JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_batches_due ON batches (status, send_at);
";

/// Postgres-backed store. Channel sub-records live in JSONB columns; a
/// single connection serialises every statement issued by this process and
/// row locks order writers across processes.
pub struct PostgresStore {
    client: Mutex<Client>,
    op_timeout: Duration,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, op_timeout: Duration) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let mut pg_config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| anyhow!("Invalid database url: {}", e))?;
        pg_config.connect_timeout(op_timeout);
        let options = format!("-c statement_timeout={}", op_timeout.as_millis());
        pg_config.options(&options);

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| anyhow!("Failed to apply schema: {}", e))?;

        info!("PostgreSQL connection established");

        Ok(Self {
            client: Mutex::new(client),
            op_timeout,
        })
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.timed(async {
            self.client.lock().await.query_one("SELECT 1", &[]).await?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow!("Database health check failed: {}", e))
    }

    async fn timed<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        timeout(self.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

fn delivery_column(channel: Channel) -> &'static str {
    match channel {
        Channel::Sms => "sms_delivery",
        Channel::Email => "email_delivery",
    }
}

fn sent_or_later() -> Vec<String> {
    MessageStatus::ALL
        .iter()
        .filter(|status| **status >= MessageStatus::Sent)
        .map(|status| status.as_str().to_string())
        .collect()
}

fn record_from_json(value: Option<JsonValue>) -> Result<Option<ChannelRecord>, StoreError> {
    value
        .map(serde_json::from_value::<ChannelRecord>)
        .transpose()
        .map_err(StoreError::from)
}

fn message_from_row(row: &Row) -> Result<Message, StoreError> {
    let recipient: Recipient = serde_json::from_value(row.try_get("recipient")?)?;

    Ok(Message {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        batch_row: row
            .try_get::<_, Option<i32>>("batch_row")?
            .map(|r| r.max(0) as usize),
        template_name: row.try_get("template_name")?,
        language: row.try_get("language")?,
        treatment: row.try_get("treatment")?,
        recipient,
        sms: record_from_json(row.try_get("sms_delivery")?)?,
        email: record_from_json(row.try_get("email_delivery")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn batch_from_row(row: &Row) -> Result<MessageBatch, StoreError> {
    let status: String = row.try_get("status")?;
    let status = BatchStatus::from_string(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown batch status '{}'", status)))?;

    Ok(MessageBatch {
        id: row.try_get("id")?,
        template_name: row.try_get("template_name")?,
        recipients: row.try_get("recipients")?,
        send_at: row.try_get("send_at")?,
        status,
        message_ids: serde_json::from_value(row.try_get("message_ids")?)?,
        row_errors: serde_json::from_value(row.try_get("row_errors")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let recipient = serde_json::to_value(&message.recipient)?;
        let sms = message.sms.as_ref().map(serde_json::to_value).transpose()?;
        let email = message.email.as_ref().map(serde_json::to_value).transpose()?;
        let batch_row = message.batch_row.map(|r| r as i32);

        self.timed(async {
            self.client
                .lock()
                .await
                .execute(
                    "INSERT INTO messages (id, batch_id, batch_row, template_name, template_name_lower, \
                     language, treatment, recipient, sms_delivery, email_delivery, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                    &[
                        &message.id,
                        &message.batch_id,
                        &batch_row,
                        &message.template_name,
                        &message.template_name.to_lowercase(),
                        &message.language,
                        &message.treatment,
                        &recipient,
                        &sms,
                        &email,
                        &message.created_at,
                        &message.updated_at,
                    ],
                )
                .await?;
            Ok(())
        })
        .await?;

        debug!(message_id = %message.id, "Message row inserted");
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.timed(async {
            let row = self
                .client
                .lock()
                .await
                .query_opt("SELECT * FROM messages WHERE id = $1", &[&id])
                .await?;
            row.as_ref().map(message_from_row).transpose()
        })
        .await
    }

    async fn set_channel_record(
        &self,
        id: Uuid,
        channel: Channel,
        record: &ChannelRecord,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)?;
        let sql = format!(
            "UPDATE messages SET {} = $2, updated_at = now() WHERE id = $1",
            delivery_column(channel)
        );

        let updated = self
            .timed(async {
                Ok(self.client.lock().await.execute(sql.as_str(), &[&id, &value]).await?)
            })
            .await?;

        if updated == 0 {
            return Err(StoreError::Conflict(format!("message {} does not exist", id)));
        }
        Ok(())
    }

    async fn has_recent_send(
        &self,
        channel: Channel,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let column = delivery_column(channel);
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM messages WHERE {col}->>'fingerprint' = $1 \
             AND created_at >= $2 AND {col}->>'status' = ANY($3))",
            col = column
        );
        let statuses = sent_or_later();

        self.timed(async {
            let row = self
                .client
                .lock()
                .await
                .query_one(sql.as_str(), &[&fingerprint, &since, &statuses])
                .await?;
            Ok(row.try_get::<_, bool>(0)?)
        })
        .await
    }

    async fn update_channel_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
        update: ChannelUpdate<'_>,
    ) -> Result<Option<(Uuid, ChannelRecord, ChannelRecord)>, StoreError> {
        let column = delivery_column(channel);
        let select = format!(
            "SELECT id, {col} FROM messages WHERE {col}->>'provider_message_id' = $1 LIMIT 1 FOR UPDATE",
            col = column
        );
        let write = format!(
            "UPDATE messages SET {} = $2, updated_at = now() WHERE id = $1",
            column
        );

        self.timed(async {
            let mut client = self.client.lock().await;
            let tx = client.transaction().await?;

            let Some(row) = tx.query_opt(select.as_str(), &[&provider_message_id]).await? else {
                return Ok(None);
            };

            let id: Uuid = row.try_get(0)?;
            let Some(before) = record_from_json(row.try_get(1)?)? else {
                return Ok(None);
            };

            let mut after = before.clone();
            update(&mut after);

            let value = serde_json::to_value(&after)?;
            tx.execute(write.as_str(), &[&id, &value]).await?;
            tx.commit().await?;

            Ok(Some((id, before, after)))
        })
        .await
    }

    async fn count_variant_usage(&self, template_name: &str, key: &VariantKey) -> Result<u64, StoreError> {
        self.timed(async {
            let row = self
                .client
                .lock()
                .await
                .query_one(
                    "SELECT COUNT(*) FROM messages WHERE template_name_lower = $1 \
                     AND language = $2 AND treatment = $3",
                    &[&template_name.to_lowercase(), &key.language, &key.treatment],
                )
                .await?;
            let count: i64 = row.try_get(0)?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn batch_row_messages(&self, batch_id: Uuid) -> Result<Vec<(usize, Uuid)>, StoreError> {
        self.timed(async {
            let rows = self
                .client
                .lock()
                .await
                .query(
                    "SELECT batch_row, id FROM messages WHERE batch_id = $1 AND batch_row IS NOT NULL",
                    &[&batch_id],
                )
                .await?;
            rows.iter()
                .map(|row| -> Result<(usize, Uuid), StoreError> {
                    let batch_row: i32 = row.try_get(0)?;
                    Ok((batch_row.max(0) as usize, row.try_get(1)?))
                })
                .collect()
        })
        .await
    }
}

#[async_trait]
impl TemplateRepository for PostgresStore {
    async fn find_template(&self, name: &str) -> Result<Option<Template>, StoreError> {
        let name_lower = name.to_lowercase();

        self.timed(async {
            let client = self.client.lock().await;

            let Some(row) = client
                .query_opt(
                    "SELECT name, created_at FROM templates WHERE name_lower = $1",
                    &[&name_lower],
                )
                .await?
            else {
                return Ok(None);
            };

            let variants = client
                .query(
                    "SELECT language, treatment, email_subject, email_body, sms_body \
                     FROM template_variants WHERE template_name_lower = $1 \
                     ORDER BY language, treatment",
                    &[&name_lower],
                )
                .await?
                .iter()
                .map(|v| {
                    Ok(TemplateVariant {
                        language: v.try_get("language")?,
                        treatment: v.try_get("treatment")?,
                        email_subject: v.try_get("email_subject")?,
                        email_body: v.try_get("email_body")?,
                        sms_body: v.try_get("sms_body")?,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;

            Ok(Some(Template {
                name: row.try_get("name")?,
                variants,
                created_at: row.try_get("created_at")?,
            }))
        })
        .await
    }

    async fn insert_template(&self, template: &Template) -> Result<bool, StoreError> {
        let name_lower = template.name.to_lowercase();

        self.timed(async {
            let mut client = self.client.lock().await;
            let tx = client.transaction().await?;

            let inserted = tx
                .execute(
                    "INSERT INTO templates (name_lower, name, created_at) VALUES ($1, $2, $3) \
                     ON CONFLICT (name_lower) DO NOTHING",
                    &[&name_lower, &template.name, &template.created_at],
                )
                .await?;

            if inserted == 0 {
                return Ok(false);
            }

            for variant in &template.variants {
                tx.execute(
                    "INSERT INTO template_variants (template_name_lower, language, treatment, \
                     email_subject, email_body, sms_body) VALUES ($1, $2, $3, $4, $5, $6)",
                    &[
                        &name_lower,
                        &variant.language,
                        &variant.treatment,
                        &variant.email_subject,
                        &variant.email_body,
                        &variant.sms_body,
                    ],
                )
                .await?;
            }

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn insert_variant(&self, template_name: &str, variant: &TemplateVariant) -> Result<bool, StoreError> {
        let name_lower = template_name.to_lowercase();

        self.timed(async {
            let client = self.client.lock().await;

            let exists = client
                .query_opt("SELECT 1 FROM templates WHERE name_lower = $1", &[&name_lower])
                .await?
                .is_some();
            if !exists {
                return Err(StoreError::Conflict(format!("template {} does not exist", template_name)));
            }

            let inserted = client
                .execute(
                    "INSERT INTO template_variants (template_name_lower, language, treatment, \
                     email_subject, email_body, sms_body) VALUES ($1, $2, $3, $4, $5, $6) \
                     ON CONFLICT DO NOTHING",
                    &[
                        &name_lower,
                        &variant.language,
                        &variant.treatment,
                        &variant.email_subject,
                        &variant.email_body,
                        &variant.sms_body,
                    ],
                )
                .await?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn delete_variant(&self, template_name: &str, key: &VariantKey) -> Result<bool, StoreError> {
        let name_lower = template_name.to_lowercase();

        self.timed(async {
            let deleted = self
                .client
                .lock()
                .await
                .execute(
                    "DELETE FROM template_variants WHERE template_name_lower = $1 \
                     AND language = $2 AND treatment = $3",
                    &[&name_lower, &key.language, &key.treatment],
                )
                .await?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[async_trait]
impl BatchRepository for PostgresStore {
    async fn insert_batch(&self, batch: &MessageBatch) -> Result<(), StoreError> {
        let message_ids = serde_json::to_value(&batch.message_ids)?;
        let row_errors = serde_json::to_value(&batch.row_errors)?;

        self.timed(async {
            self.client
                .lock()
                .await
                .execute(
                    "INSERT INTO batches (id, template_name, recipients, send_at, status, \
                     message_ids, row_errors, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                    &[
                        &batch.id,
                        &batch.template_name,
                        &batch.recipients,
                        &batch.send_at,
                        &batch.status.as_str(),
                        &message_ids,
                        &row_errors,
                        &batch.created_at,
                        &batch.updated_at,
                    ],
                )
                .await?;
            Ok(())
        })
        .await
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<MessageBatch>, StoreError> {
        self.timed(async {
            let row = self
                .client
                .lock()
                .await
                .query_opt("SELECT * FROM batches WHERE id = $1", &[&id])
                .await?;
            row.as_ref().map(batch_from_row).transpose()
        })
        .await
    }

    async fn claim_batch(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<MessageBatch>, StoreError> {
        self.timed(async {
            let row = self
                .client
                .lock()
                .await
                .query_opt(
                    "UPDATE batches SET status = $2, updated_at = now() \
                     WHERE id = $1 AND (status = $3 OR (status = $2 AND updated_at < $4)) \
                     RETURNING *",
                    &[
                        &id,
                        &BatchStatus::Processing.as_str(),
                        &BatchStatus::Scheduled.as_str(),
                        &stale_before,
                    ],
                )
                .await?;
            row.as_ref().map(batch_from_row).transpose()
        })
        .await
    }

    async fn renew_batch(&self, id: Uuid) -> Result<(), StoreError> {
        self.timed(async {
            self.client
                .lock()
                .await
                .execute(
                    "UPDATE batches SET updated_at = now() WHERE id = $1 AND status = $2",
                    &[&id, &BatchStatus::Processing.as_str()],
                )
                .await?;
            Ok(())
        })
        .await
    }

    async fn release_batch(&self, id: Uuid) -> Result<(), StoreError> {
        self.timed(async {
            self.client
                .lock()
                .await
                .execute(
                    "UPDATE batches SET status = $3, updated_at = now() WHERE id = $1 AND status = $2",
                    &[
                        &id,
                        &BatchStatus::Processing.as_str(),
                        &BatchStatus::Scheduled.as_str(),
                    ],
                )
                .await?;
            Ok(())
        })
        .await
    }

    async fn complete_batch(
        &self,
        id: Uuid,
        message_ids: &[Uuid],
        row_errors: &[RowError],
    ) -> Result<(), StoreError> {
        let ids = serde_json::to_value(message_ids)?;
        let errors = serde_json::to_value(row_errors)?;

        let updated = self
            .timed(async {
                Ok(self
                    .client
                    .lock()
                    .await
                    .execute(
                        "UPDATE batches SET status = $2, message_ids = $3, row_errors = $4, \
                         updated_at = now() WHERE id = $1",
                        &[&id, &BatchStatus::Completed.as_str(), &ids, &errors],
                    )
                    .await?)
            })
            .await?;

        if updated == 0 {
            return Err(StoreError::Conflict(format!("batch {} does not exist", id)));
        }
        Ok(())
    }

    async fn due_batches(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        self.timed(async {
            let rows = self
                .client
                .lock()
                .await
                .query(
                    "SELECT id FROM batches WHERE (send_at IS NULL OR send_at <= $2) \
                     AND (status = $1 OR (status = $3 AND updated_at < $4)) \
                     ORDER BY created_at",
                    &[
                        &BatchStatus::Scheduled.as_str(),
                        &now,
                        &BatchStatus::Processing.as_str(),
                        &stale_before,
                    ],
                )
                .await?;
            rows.iter()
                .map(|row| row.try_get::<_, Uuid>(0).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn delete_scheduled_batch(&self, id: Uuid) -> Result<bool, StoreError> {
        self.timed(async {
            let deleted = self
                .client
                .lock()
                .await
                .execute(
                    "DELETE FROM batches WHERE id = $1 AND status = $2",
                    &[&id, &BatchStatus::Scheduled.as_str()],
                )
                .await?;
            Ok(deleted > 0)
        })
        .await
    }
}
