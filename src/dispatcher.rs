use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::{
    error::{DispatchError, SendError, StoreError},
    gateway::{ChannelGateway, SendReceipt},
    models::{
        callback::ProviderStatusMap,
        message::{Channel, ChannelRecord, DispatchRequest, Message},
        status::{ChannelStatus, MessageStatus},
        template::RenderedContent,
        validation::{RecipientError, validate_recipient},
    },
    render::render_variant,
    store::MessageStore,
    suppression::{DuplicateSuppressionIndex, Gate},
    templates::TemplateStore,
};

pub const DUPLICATE_ERROR_MESSAGE: &str = "Duplicate message";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on a single provider call, including the gateway's own
    /// retries.
    pub provider_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(30),
        }
    }
}

/// Status recorded right after a provider accepted a send.
pub fn initial_status(channel: Channel, provider_status: &str) -> MessageStatus {
    ProviderStatusMap::map(channel, provider_status).max(MessageStatus::SubmissionSucceeded)
}

pub struct MessageDispatcher {
    templates: TemplateStore,
    messages: Arc<dyn MessageStore>,
    suppression: Arc<DuplicateSuppressionIndex>,
    sms_gateway: Arc<dyn ChannelGateway>,
    email_gateway: Arc<dyn ChannelGateway>,
    config: DispatcherConfig,
}

impl MessageDispatcher {
    pub fn new(
        templates: TemplateStore,
        messages: Arc<dyn MessageStore>,
        suppression: Arc<DuplicateSuppressionIndex>,
        sms_gateway: Arc<dyn ChannelGateway>,
        email_gateway: Arc<dyn ChannelGateway>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            templates,
            messages,
            suppression,
            sms_gateway,
            email_gateway,
            config,
        }
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    /// Validates, renders and sends one request on every channel it
    /// addresses. Validation and template errors are returned before anything
    /// is stored; provider failures and duplicates only show up on the
    /// returned message's channel records.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<Message, DispatchError> {
        let recipient = validate_recipient(&request).map_err(|e| match e {
            RecipientError::Fields(errors) => DispatchError::InvalidRecipients(errors),
            RecipientError::Phone(e) => DispatchError::PhoneParsing(e),
        })?;

        let (template, variant) = self
            .templates
            .resolve(
                &request.template_name,
                request.language_or_default(),
                request.treatment_or_default(),
            )
            .await?;

        let rendered = recipient
            .channels()
            .into_iter()
            .map(|channel| {
                render_variant(&variant, channel, &request.params).map(|content| (channel, content))
            })
            .collect::<Result<Vec<_>, DispatchError>>()?;

        let mut message = Message::new(
            template.name,
            variant.language,
            variant.treatment,
            recipient,
            request.batch_id,
        );
        message.batch_row = request.batch_row;
        self.messages.insert_message(&message).await?;

        info!(
            message_id = %message.id,
            template = %message.template_name,
            language = %message.language,
            treatment = %message.treatment,
            channels = rendered.len(),
            "Dispatching message"
        );

        let outcomes = join_all(
            rendered
                .into_iter()
                .map(|(channel, content)| self.dispatch_channel(&message, channel, content)),
        )
        .await;

        for outcome in outcomes {
            outcome?;
        }

        self.messages
            .get_message(message.id)
            .await?
            .ok_or(DispatchError::UnknownMessage(message.id))
    }

    async fn dispatch_channel(
        &self,
        message: &Message,
        channel: Channel,
        content: RenderedContent,
    ) -> Result<(), StoreError> {
        let Some(address) = message.recipient.address(channel) else {
            return Ok(());
        };

        let fingerprint = match self.suppression.check_and_claim(&address, channel, &content).await? {
            Gate::Suppressed { fingerprint } => {
                info!(
                    message_id = %message.id,
                    %channel,
                    %fingerprint,
                    "Send suppressed as duplicate"
                );
                let record = ChannelRecord::new(ChannelStatus::Duplicate, fingerprint, content.body)
                    .with_subject(content.subject)
                    .with_error(DUPLICATE_ERROR_MESSAGE.to_string());
                return self.messages.set_channel_record(message.id, channel, &record).await;
            }
            Gate::Clear { fingerprint } => fingerprint,
        };

        let outcome = self.send(channel, &address, &content).await;

        let record = match outcome {
            Ok(receipt) => {
                let status = initial_status(channel, &receipt.provider_status);
                info!(
                    message_id = %message.id,
                    %channel,
                    provider_message_id = %receipt.provider_message_id,
                    provider_status = %receipt.provider_status,
                    %status,
                    "Channel send accepted by provider"
                );
                let mut record = ChannelRecord::new(status.into(), fingerprint.clone(), content.body)
                    .with_subject(content.subject);
                record.provider_message_id = Some(receipt.provider_message_id);
                record.provider_created_at = Some(receipt.provider_created_at);
                record.provider_status = Some(receipt.provider_status);
                record
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    %channel,
                    error = %e,
                    "Channel send failed"
                );
                ChannelRecord::new(
                    MessageStatus::SubmissionFailed.into(),
                    fingerprint.clone(),
                    content.body,
                )
                .with_subject(content.subject)
                .with_error(e.message)
            }
        };

        let persisted = self.messages.set_channel_record(message.id, channel, &record).await;
        self.suppression.release(&fingerprint).await;
        persisted
    }

    async fn send(
        &self,
        channel: Channel,
        address: &str,
        content: &RenderedContent,
    ) -> Result<SendReceipt, SendError> {
        let gateway = match channel {
            Channel::Sms => &self.sms_gateway,
            Channel::Email => &self.email_gateway,
        };

        tokio::time::timeout(
            self.config.provider_timeout,
            gateway.send(address, &content.body, content.subject.as_deref()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(SendError::new(format!(
                "{} provider call timed out after {}s",
                channel,
                self.config.provider_timeout.as_secs()
            )))
        })
    }
}
