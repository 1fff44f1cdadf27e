use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::DispatchError,
    models::{
        callback::StatusCallback,
        message::{Channel, ChannelRecord},
        status::{ChannelStatus, MessageStatus},
    },
    store::MessageStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub message_id: Uuid,
    pub previous: ChannelStatus,
    pub current: ChannelStatus,
    pub applied: bool,
}

/// Applies `new_status` to `record` if it advances the lifecycle. Raw status
/// and error details are recorded either way. `duplicate` is terminal.
pub fn apply_to_record(
    record: &mut ChannelRecord,
    new_status: MessageStatus,
    raw_status: &str,
    error_details: Option<&HashMap<String, String>>,
) -> bool {
    record.provider_status = Some(raw_status.to_string());
    if let Some(details) = error_details {
        record.provider_error = Some(details.clone());
    }

    if record.status.is_duplicate() || !new_status.is_after(record.lifecycle_status()) {
        return false;
    }

    record.status = ChannelStatus::Lifecycle(new_status);
    true
}

pub struct StatusReconciler {
    messages: Arc<dyn MessageStore>,
}

impl StatusReconciler {
    pub fn new(messages: Arc<dyn MessageStore>) -> Self {
        Self { messages }
    }

    pub async fn apply_status(
        &self,
        provider_message_id: &str,
        channel: Channel,
        new_status: MessageStatus,
        raw_status: &str,
        error_details: Option<&HashMap<String, String>>,
    ) -> Result<ReconcileOutcome, DispatchError> {
        let update = |record: &mut ChannelRecord| {
            apply_to_record(record, new_status, raw_status, error_details);
        };

        let Some((message_id, before, after)) = self
            .messages
            .update_channel_by_provider_id(channel, provider_message_id, &update)
            .await?
        else {
            warn!(
                provider_message_id,
                %channel,
                raw_status,
                "Status callback for unknown provider message id"
            );
            return Err(DispatchError::MessageNotFound {
                channel,
                provider_message_id: provider_message_id.to_string(),
            });
        };

        let applied = before.status != after.status;
        if applied {
            info!(
                %message_id,
                %channel,
                provider_message_id,
                from = %before.status,
                to = %after.status,
                "Channel status advanced"
            );
        } else {
            debug!(
                %message_id,
                %channel,
                provider_message_id,
                stored = %before.status,
                received = %new_status,
                "Stale or repeated status callback ignored"
            );
        }

        Ok(ReconcileOutcome {
            message_id,
            previous: before.status,
            current: after.status,
            applied,
        })
    }

    /// Maps the callback's raw status and applies it.
    pub async fn apply_callback(&self, callback: &StatusCallback) -> Result<ReconcileOutcome, DispatchError> {
        self.apply_status(
            &callback.provider_message_id,
            callback.channel,
            callback.status(),
            &callback.raw_status,
            callback.provider_error_details.as_ref(),
        )
        .await
    }
}
