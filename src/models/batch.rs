use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::status::BatchStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub error: String,
}

/// A scheduled or immediate group send against one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub id: Uuid,
    pub template_name: String,

    /// Raw recipient file, parsed again when the batch is expanded.
    #[serde(skip_serializing)]
    pub recipients: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_at: Option<DateTime<Utc>>,

    pub status: BatchStatus,
    pub message_ids: Vec<Uuid>,
    pub row_errors: Vec<RowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageBatch {
    pub fn new(template_name: String, recipients: String, send_at: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            template_name,
            recipients,
            send_at,
            status: BatchStatus::Scheduled,
            message_ids: Vec::new(),
            row_errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.send_at.is_none_or(|at| at <= now)
    }

    /// `processing` batches carry a lease renewed through `updated_at`; one
    /// whose worker stopped renewing before `stale_before` may be taken over.
    pub fn is_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            BatchStatus::Scheduled => true,
            BatchStatus::Processing => self.updated_at < stale_before,
            BatchStatus::Completed => false,
        }
    }
}
