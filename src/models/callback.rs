use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::{message::Channel, status::MessageStatus};

/// Provider callback normalised to one shape regardless of vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCallback {
    pub provider_message_id: String,
    pub channel: Channel,
    pub raw_status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_error_details: Option<HashMap<String, String>>,
}

impl StatusCallback {
    pub fn new(provider_message_id: impl Into<String>, channel: Channel, raw_status: impl Into<String>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            channel,
            raw_status: raw_status.into(),
            provider_error_details: None,
        }
    }

    pub fn with_error_details(mut self, details: HashMap<String, String>) -> Self {
        if !details.is_empty() {
            self.provider_error_details = Some(details);
        }
        self
    }

    /// Canonical status for this callback's raw provider status.
    pub fn status(&self) -> MessageStatus {
        ProviderStatusMap::map(self.channel, &self.raw_status)
    }

    /// Builds a callback from a Twilio status webhook form body.
    pub fn from_twilio_form(form: &HashMap<String, String>) -> Option<Self> {
        let sid = form.get("MessageSid").or_else(|| form.get("SmsSid"))?;
        let status = form.get("MessageStatus").or_else(|| form.get("SmsStatus"))?;

        let details: HashMap<String, String> = ["ErrorCode", "ErrorMessage"]
            .into_iter()
            .filter_map(|key| {
                form.get(key)
                    .filter(|v| !v.is_empty())
                    .map(|v| (key.to_string(), v.clone()))
            })
            .collect();

        Some(Self::new(sid.clone(), Channel::Sms, status.clone()).with_error_details(details))
    }

    /// Builds a callback from a Mailgun `event-data` object.
    ///
    /// Mailgun reports temporary and permanent failures under the same
    /// `failed` event; the severity is folded into the raw status so the
    /// mapping can tell them apart.
    pub fn from_mailgun_event(event_data: &MailgunEventData) -> Option<Self> {
        let message_id = event_data
            .message
            .as_ref()
            .and_then(|m| m.headers.get("message-id"))
            .and_then(JsonValue::as_str)?;

        let raw_status = match (event_data.event.as_str(), event_data.severity.as_deref()) {
            ("failed", Some(severity)) => format!("failed:{}", severity),
            (event, _) => event.to_string(),
        };

        let mut details = HashMap::new();
        if let Some(reason) = &event_data.reason {
            details.insert("reason".to_string(), reason.clone());
        }
        if let Some(delivery_status) = &event_data.delivery_status {
            for (key, value) in delivery_status {
                let text = match value {
                    JsonValue::Null => continue,
                    JsonValue::String(s) if s.is_empty() => continue,
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                details.insert(key.clone(), text);
            }
        }

        Some(
            Self::new(message_id.trim_matches(['<', '>']), Channel::Email, raw_status)
                .with_error_details(details),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailgunWebhook {
    pub signature: MailgunSignature,

    #[serde(rename = "event-data")]
    pub event_data: MailgunEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailgunSignature {
    pub timestamp: String,
    pub token: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailgunEventData {
    pub event: String,

    #[serde(default)]
    pub severity: Option<String>,

    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default)]
    pub message: Option<MailgunMessage>,

    #[serde(default, rename = "delivery-status")]
    pub delivery_status: Option<HashMap<String, JsonValue>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailgunMessage {
    #[serde(default)]
    pub headers: HashMap<String, JsonValue>,
}

/// Maps vendor status strings onto the canonical lifecycle.
pub struct ProviderStatusMap;

impl ProviderStatusMap {
    pub fn map(channel: Channel, raw: &str) -> MessageStatus {
        let raw = raw.trim().to_ascii_lowercase();
        match channel {
            Channel::Sms => Self::map_twilio(&raw),
            Channel::Email => Self::map_mailgun(&raw),
        }
    }

    fn map_twilio(raw: &str) -> MessageStatus {
        match raw {
            "accepted" | "queued" | "scheduled" => MessageStatus::Queued,
            "sending" => MessageStatus::SubmissionSucceeded,
            "sent" => MessageStatus::Sent,
            "delivered" | "read" => MessageStatus::Delivered,
            "undelivered" => MessageStatus::Undelivered,
            "failed" | "canceled" => MessageStatus::Failed,
            _ => MessageStatus::Unmapped,
        }
    }

    fn map_mailgun(raw: &str) -> MessageStatus {
        match raw {
            "accepted" | "queued" => MessageStatus::Queued,
            "delivered" | "opened" | "clicked" => MessageStatus::Delivered,
            "failed" | "failed:permanent" => MessageStatus::Failed,
            "failed:temporary" => MessageStatus::Undelivered,
            "unsubscribed" => MessageStatus::Unsubscribed,
            _ => MessageStatus::Unmapped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twilio_form_maps_error_fields() {
        let form: HashMap<String, String> = [
            ("MessageSid", "SM123"),
            ("MessageStatus", "undelivered"),
            ("ErrorCode", "30003"),
            ("ErrorMessage", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let callback = StatusCallback::from_twilio_form(&form).unwrap();
        assert_eq!(callback.provider_message_id, "SM123");
        assert_eq!(callback.status(), MessageStatus::Undelivered);
        let details = callback.provider_error_details.unwrap();
        assert_eq!(details.get("ErrorCode").map(String::as_str), Some("30003"));
        assert!(!details.contains_key("ErrorMessage"));
    }

    #[test]
    fn mailgun_failure_severity_changes_mapping() {
        let event: MailgunEventData = serde_json::from_value(serde_json::json!({
            "event": "failed",
            "severity": "temporary",
            "message": {"headers": {"message-id": "<abc@mg.example.com>"}},
            "delivery-status": {"code": 452, "message": "mailbox full", "description": ""}
        }))
        .unwrap();

        let callback = StatusCallback::from_mailgun_event(&event).unwrap();
        assert_eq!(callback.provider_message_id, "abc@mg.example.com");
        assert_eq!(callback.status(), MessageStatus::Undelivered);
        let details = callback.provider_error_details.unwrap();
        assert_eq!(details.get("code").map(String::as_str), Some("452"));
        assert!(!details.contains_key("description"));
    }

    #[test]
    fn unknown_raw_status_is_unmapped() {
        assert_eq!(ProviderStatusMap::map(Channel::Sms, "exploded"), MessageStatus::Unmapped);
        assert_eq!(ProviderStatusMap::map(Channel::Email, "complained"), MessageStatus::Unmapped);
    }
}
