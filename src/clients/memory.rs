use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{
        batch::{MessageBatch, RowError},
        message::{Channel, ChannelRecord, Message},
        status::{BatchStatus, MessageStatus},
        template::{Template, TemplateVariant, VariantKey},
    },
    store::{BatchRepository, ChannelUpdate, MessageStore, TemplateRepository},
};

#[derive(Default)]
struct Tables {
    messages: HashMap<Uuid, Message>,
    /// Keyed by lowercased template name.
    templates: HashMap<String, Template>,
    batches: HashMap<Uuid, MessageBatch>,
}

/// Single-process store; one lock covers every table so each call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self) -> usize {
        self.tables.lock().await.messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.messages.contains_key(&message.id) {
            return Err(StoreError::Conflict(format!("message {} already exists", message.id)));
        }
        tables.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.tables.lock().await.messages.get(&id).cloned())
    }

    async fn set_channel_record(
        &self,
        id: Uuid,
        channel: Channel,
        record: &ChannelRecord,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let message = tables
            .messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::Conflict(format!("message {} does not exist", id)))?;

        *message.channel_mut(channel) = Some(record.clone());
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn has_recent_send(
        &self,
        channel: Channel,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.messages.values().any(|message| {
            message.created_at >= since
                && message.channel(channel).is_some_and(|record| {
                    record.fingerprint == fingerprint
                        && record
                            .lifecycle_status()
                            .is_some_and(|status| status >= MessageStatus::Sent)
                })
        }))
    }

    async fn update_channel_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
        update: ChannelUpdate<'_>,
    ) -> Result<Option<(Uuid, ChannelRecord, ChannelRecord)>, StoreError> {
        let mut tables = self.tables.lock().await;

        let Some(message) = tables.messages.values_mut().find(|message| {
            message
                .channel(channel)
                .and_then(|record| record.provider_message_id.as_deref())
                == Some(provider_message_id)
        }) else {
            return Ok(None);
        };

        let id = message.id;
        let Some(record) = message.channel_mut(channel).as_mut() else {
            return Ok(None);
        };

        let before = record.clone();
        update(record);
        let after = record.clone();
        message.updated_at = Utc::now();

        Ok(Some((id, before, after)))
    }

    async fn count_variant_usage(&self, template_name: &str, key: &VariantKey) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        let count = tables
            .messages
            .values()
            .filter(|m| {
                m.template_name.eq_ignore_ascii_case(template_name)
                    && m.language == key.language
                    && m.treatment == key.treatment
            })
            .count();
        Ok(count as u64)
    }

    async fn batch_row_messages(&self, batch_id: Uuid) -> Result<Vec<(usize, Uuid)>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .values()
            .filter(|m| m.batch_id == Some(batch_id))
            .filter_map(|m| m.batch_row.map(|row| (row, m.id)))
            .collect())
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn find_template(&self, name: &str) -> Result<Option<Template>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.templates.get(&name.to_lowercase()).cloned())
    }

    async fn insert_template(&self, template: &Template) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let key = template.name.to_lowercase();
        if tables.templates.contains_key(&key) {
            return Ok(false);
        }
        tables.templates.insert(key, template.clone());
        Ok(true)
    }

    async fn insert_variant(&self, template_name: &str, variant: &TemplateVariant) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let template = tables
            .templates
            .get_mut(&template_name.to_lowercase())
            .ok_or_else(|| StoreError::Conflict(format!("template {} does not exist", template_name)))?;

        if template.variant(&variant.key()).is_some() {
            return Ok(false);
        }
        template.variants.push(variant.clone());
        Ok(true)
    }

    async fn delete_variant(&self, template_name: &str, key: &VariantKey) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(template) = tables.templates.get_mut(&template_name.to_lowercase()) else {
            return Ok(false);
        };

        let before = template.variants.len();
        template
            .variants
            .retain(|v| !(v.language == key.language && v.treatment == key.treatment));
        Ok(template.variants.len() < before)
    }
}

#[async_trait]
impl BatchRepository for MemoryStore {
    async fn insert_batch(&self, batch: &MessageBatch) -> Result<(), StoreError> {
        self.tables.lock().await.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<MessageBatch>, StoreError> {
        Ok(self.tables.lock().await.batches.get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<MessageBatch>, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.batches.get_mut(&id) {
            Some(batch) if batch.is_claimable(stale_before) => {
                batch.status = BatchStatus::Processing;
                batch.updated_at = Utc::now();
                Ok(Some(batch.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn renew_batch(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(batch) = tables.batches.get_mut(&id) {
            if batch.status == BatchStatus::Processing {
                batch.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn release_batch(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(batch) = tables.batches.get_mut(&id) {
            if batch.status == BatchStatus::Processing {
                batch.status = BatchStatus::Scheduled;
                batch.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn complete_batch(
        &self,
        id: Uuid,
        message_ids: &[Uuid],
        row_errors: &[RowError],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let batch = tables
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::Conflict(format!("batch {} does not exist", id)))?;

        batch.status = BatchStatus::Completed;
        batch.message_ids = message_ids.to_vec();
        batch.row_errors = row_errors.to_vec();
        batch.updated_at = Utc::now();
        Ok(())
    }

    async fn due_batches(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .batches
            .values()
            .filter(|b| b.is_due(now) && b.is_claimable(stale_before))
            .map(|b| b.id)
            .collect())
    }

    async fn delete_scheduled_batch(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.batches.get(&id) {
            Some(batch) if batch.status == BatchStatus::Scheduled => {
                tables.batches.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
