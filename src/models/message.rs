use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    phone::PhoneNumber,
    status::{ChannelStatus, MessageStatus},
    template::{DEFAULT_LANGUAGE, DEFAULT_TREATMENT},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "sms" => Some(Channel::Sms),
            "email" => Some(Channel::Email),
            _ => None,
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Validated recipient; at least one of the two fields is always set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub phone: Option<PhoneNumber>,
    pub email: Option<String>,
}

impl Recipient {
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = Vec::with_capacity(2);
        if self.phone.is_some() {
            channels.push(Channel::Sms);
        }
        if self.email.is_some() {
            channels.push(Channel::Email);
        }
        channels
    }

    /// Normalised identifier used for fingerprinting and provider addressing.
    pub fn address(&self, channel: Channel) -> Option<String> {
        match channel {
            Channel::Sms => self.phone.as_ref().map(|p| p.as_str().to_string()),
            Channel::Email => self.email.clone(),
        }
    }
}

/// Per-channel sub-record embedded in a `Message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub status: ChannelStatus,
    pub fingerprint: String,
    pub body: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<HashMap<String, String>>,
}

impl ChannelRecord {
    pub fn new(status: ChannelStatus, fingerprint: String, body: String) -> Self {
        Self {
            status,
            fingerprint,
            body,
            subject: None,
            error_message: None,
            provider_message_id: None,
            provider_created_at: None,
            provider_status: None,
            provider_error: None,
        }
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error_message = Some(error);
        self
    }

    pub fn lifecycle_status(&self) -> Option<MessageStatus> {
        self.status.lifecycle()
    }
}

/// One logical notification with at most one SMS and one email attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,

    /// 1-based row of the recipient file this message was expanded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_row: Option<usize>,

    pub template_name: String,
    pub language: String,
    pub treatment: String,
    pub recipient: Recipient,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<ChannelRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<ChannelRecord>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        template_name: String,
        language: String,
        treatment: String,
        recipient: Recipient,
        batch_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            batch_id,
            batch_row: None,
            template_name,
            language,
            treatment,
            recipient,
            sms: None,
            email: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelRecord> {
        match channel {
            Channel::Sms => self.sms.as_ref(),
            Channel::Email => self.email.as_ref(),
        }
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut Option<ChannelRecord> {
        match channel {
            Channel::Sms => &mut self.sms,
            Channel::Email => &mut self.email,
        }
    }
}

/// Inbound request to notify one recipient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub template_name: String,

    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub treatment: Option<String>,

    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_row: Option<usize>,
}

impl DispatchRequest {
    pub fn new(template_name: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            ..Default::default()
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_treatment(mut self, treatment: impl Into<String>) -> Self {
        self.treatment = Some(treatment.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn language_or_default(&self) -> &str {
        non_blank(self.language.as_deref()).unwrap_or(DEFAULT_LANGUAGE)
    }

    pub fn treatment_or_default(&self) -> &str {
        non_blank(self.treatment.as_deref()).unwrap_or(DEFAULT_TREATMENT)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Unit of work carried on the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Dispatch(DispatchRequest),
    ExpandBatch { batch_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub trace_id: String,
    pub task: Task,
}

impl Envelope {
    pub fn new(task: Task) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            task,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original: Envelope,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
}
