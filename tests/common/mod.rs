#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use dispatch_service::{
    batch::{BatchIngestor, CsvReader},
    clients::memory::MemoryStore,
    dispatcher::{DispatcherConfig, MessageDispatcher},
    error::SendError,
    gateway::{ChannelGateway, SendReceipt},
    models::{
        message::Channel,
        template::{Template, VariantContent},
    },
    reconciler::StatusReconciler,
    suppression::{DuplicateSuppressionIndex, MemoryClaims},
    templates::TemplateStore,
};

pub const WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub body: String,
    pub subject: Option<String>,
}

enum Outcome {
    Accept(String),
    Fail(String),
}

/// Gateway double that records every call and answers with a fixed outcome.
pub struct FakeGateway {
    channel: Channel,
    outcome: Outcome,
    delay: Duration,
    calls: AtomicUsize,
    sent: Mutex<Vec<SentMessage>>,
}

impl FakeGateway {
    pub fn accepting(channel: Channel, provider_status: &str) -> Self {
        Self::with_outcome(channel, Outcome::Accept(provider_status.to_string()))
    }

    pub fn failing(channel: Channel, message: &str) -> Self {
        Self::with_outcome(channel, Outcome::Fail(message.to_string()))
    }

    fn with_outcome(channel: Channel, outcome: Outcome) -> Self {
        Self {
            channel,
            outcome,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelGateway for FakeGateway {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        recipient: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().unwrap().push(SentMessage {
            recipient: recipient.to_string(),
            body: body.to_string(),
            subject: subject.map(str::to_string),
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.outcome {
            Outcome::Accept(status) => Ok(SendReceipt {
                provider_message_id: format!("{}-{}", self.channel, n),
                provider_status: status.clone(),
                provider_created_at: Utc::now(),
            }),
            Outcome::Fail(message) => Err(SendError::new(message.clone())),
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub sms: Arc<FakeGateway>,
    pub email: Arc<FakeGateway>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub reconciler: StatusReconciler,
    pub ingestor: Arc<BatchIngestor>,
}

impl Harness {
    /// Both providers report a status at or past `sent` on acceptance, so
    /// the first send of any content counts against the suppression window.
    pub fn new() -> Self {
        Self::with_gateways(
            FakeGateway::accepting(Channel::Sms, "sent"),
            FakeGateway::accepting(Channel::Email, "delivered"),
        )
    }

    pub fn with_gateways(sms: FakeGateway, email: FakeGateway) -> Self {
        Self::build(sms, email, DispatcherConfig::default())
    }

    pub fn build(sms: FakeGateway, email: FakeGateway, config: DispatcherConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let sms = Arc::new(sms);
        let email = Arc::new(email);

        let suppression = Arc::new(DuplicateSuppressionIndex::new(
            store.clone(),
            Arc::new(MemoryClaims::new()),
            WINDOW,
            Duration::from_secs(60),
        ));

        let dispatcher = Arc::new(MessageDispatcher::new(
            TemplateStore::new(store.clone(), store.clone()),
            store.clone(),
            suppression,
            sms.clone(),
            email.clone(),
            config,
        ));

        let ingestor = Arc::new(BatchIngestor::new(
            dispatcher.clone(),
            store.clone(),
            Arc::new(CsvReader::default()),
        ));

        Self {
            reconciler: StatusReconciler::new(store.clone()),
            store,
            sms,
            email,
            dispatcher,
            ingestor,
        }
    }

    pub fn templates(&self) -> &TemplateStore {
        self.dispatcher.templates()
    }

    /// Creates `name` with a default variant using the same body on both
    /// channels.
    pub async fn seed_template(&self, name: &str, subject: &str, body: &str) -> Template {
        self.templates()
            .create_template(name, content(subject, body, body))
            .await
            .unwrap()
    }
}

pub fn content(email_subject: &str, email_body: &str, sms_body: &str) -> VariantContent {
    VariantContent {
        email_subject: email_subject.to_string(),
        email_body: email_body.to_string(),
        sms_body: sms_body.to_string(),
    }
}
