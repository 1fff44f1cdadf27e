use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::SendError, models::message::Channel};

/// What a provider reports back after accepting a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: String,
    pub provider_status: String,
    pub provider_created_at: DateTime<Utc>,
}

/// Provider send API for one channel. Nothing outside `clients/` knows which
/// vendor sits behind it.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    fn channel(&self) -> Channel;

    /// `recipient` is the channel address as normalised by the caller: the
    /// 10-digit phone number for SMS, the email address for email.
    async fn send(
        &self,
        recipient: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<SendReceipt, SendError>;
}
