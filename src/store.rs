//! Persistence contracts.
//!
//! Implementations must make every method atomic with respect to the row it
//! touches; `update_channel_by_provider_id` in particular is a per-row
//! read-modify-write that concurrent callers observe serially.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::{
        batch::{MessageBatch, RowError},
        message::{Channel, ChannelRecord, Message},
        template::{Template, TemplateVariant, VariantKey},
    },
};

/// Mutation applied to a channel record while its row is locked.
pub type ChannelUpdate<'a> = &'a (dyn Fn(&mut ChannelRecord) + Send + Sync);

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Writes the sub-record of one channel, leaving the other untouched.
    async fn set_channel_record(
        &self,
        id: Uuid,
        channel: Channel,
        record: &ChannelRecord,
    ) -> Result<(), StoreError>;

    /// True when a message created at or after `since` carries `fingerprint`
    /// on `channel` with a status at or past `sent`.
    async fn has_recent_send(
        &self,
        channel: Channel,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Locks the message owning `provider_message_id` on `channel`, applies
    /// `update` to that channel's record and persists it. Returns the message
    /// id with the record as it was before and after, or `None` when no
    /// message owns the id.
    async fn update_channel_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
        update: ChannelUpdate<'_>,
    ) -> Result<Option<(Uuid, ChannelRecord, ChannelRecord)>, StoreError>;

    async fn count_variant_usage(&self, template_name: &str, key: &VariantKey) -> Result<u64, StoreError>;

    /// Row number and message id of every message already expanded from
    /// `batch_id`.
    async fn batch_row_messages(&self, batch_id: Uuid) -> Result<Vec<(usize, Uuid)>, StoreError>;
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Case-insensitive lookup by name.
    async fn find_template(&self, name: &str) -> Result<Option<Template>, StoreError>;

    /// Returns `false` when a template with the same name already exists.
    async fn insert_template(&self, template: &Template) -> Result<bool, StoreError>;

    /// Returns `false` when the variant key already exists.
    async fn insert_variant(&self, template_name: &str, variant: &TemplateVariant) -> Result<bool, StoreError>;

    /// Returns `false` when no such variant exists.
    async fn delete_variant(&self, template_name: &str, key: &VariantKey) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn insert_batch(&self, batch: &MessageBatch) -> Result<(), StoreError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<MessageBatch>, StoreError>;

    /// Moves a batch to `processing`. A batch is claimable while `scheduled`,
    /// or while `processing` with a lease last renewed before `stale_before`.
    /// Only one caller wins; everyone else gets `None`.
    async fn claim_batch(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<MessageBatch>, StoreError>;

    /// Extends the lease of a `processing` batch.
    async fn renew_batch(&self, id: Uuid) -> Result<(), StoreError>;

    /// Hands a `processing` batch back to `scheduled` so the next pass retries it.
    async fn release_batch(&self, id: Uuid) -> Result<(), StoreError>;

    async fn complete_batch(
        &self,
        id: Uuid,
        message_ids: &[Uuid],
        row_errors: &[RowError],
    ) -> Result<(), StoreError>;

    /// Scheduled batches whose `send_at` has passed, plus `processing`
    /// batches whose lease expired before `stale_before`.
    async fn due_batches(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Deletes the batch only while it is still `scheduled`.
    async fn delete_scheduled_batch(&self, id: Uuid) -> Result<bool, StoreError>;
}
