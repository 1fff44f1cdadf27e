use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// Delivery lifecycle of one channel, ordered from least to most advanced.
///
/// The declaration order is the lifecycle order; `Ord` is derived from it and
/// every comparison in the crate goes through that derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    SubmissionFailed,
    Unmapped,
    Unsubscribed,
    Queued,
    SubmissionSucceeded,
    Sent,
    Failed,
    Undelivered,
    Delivered,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 9] = [
        MessageStatus::SubmissionFailed,
        MessageStatus::Unmapped,
        MessageStatus::Unsubscribed,
        MessageStatus::Queued,
        MessageStatus::SubmissionSucceeded,
        MessageStatus::Sent,
        MessageStatus::Failed,
        MessageStatus::Undelivered,
        MessageStatus::Delivered,
    ];

    /// True when `self` is strictly later in the lifecycle than `current`.
    /// An unset current status is earlier than everything.
    pub fn is_after(self, current: Option<MessageStatus>) -> bool {
        match current {
            None => true,
            Some(current) => self > current,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::SubmissionFailed => "submission_failed",
            MessageStatus::Unmapped => "unmapped",
            MessageStatus::Unsubscribed => "unsubscribed",
            MessageStatus::Queued => "queued",
            MessageStatus::SubmissionSucceeded => "submission_succeeded",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Undelivered => "undelivered",
            MessageStatus::Delivered => "delivered",
        }
    }

    /// Statuses that count as "already sent" for duplicate suppression.
    pub fn at_or_past_sent() -> impl Iterator<Item = MessageStatus> {
        Self::ALL.into_iter().filter(|s| *s >= MessageStatus::Sent)
    }
}

impl Display for MessageStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown message status '{}'", s))
    }
}

/// Stored state of a channel: either a lifecycle status or the terminal
/// `duplicate` marker written when a send was suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ChannelStatus {
    Duplicate,
    Lifecycle(MessageStatus),
}

impl ChannelStatus {
    pub fn lifecycle(&self) -> Option<MessageStatus> {
        match self {
            ChannelStatus::Duplicate => None,
            ChannelStatus::Lifecycle(status) => Some(*status),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ChannelStatus::Duplicate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Duplicate => "duplicate",
            ChannelStatus::Lifecycle(status) => status.as_str(),
        }
    }
}

impl From<MessageStatus> for ChannelStatus {
    fn from(status: MessageStatus) -> Self {
        ChannelStatus::Lifecycle(status)
    }
}

impl From<ChannelStatus> for String {
    fn from(status: ChannelStatus) -> Self {
        status.as_str().to_string()
    }
}

impl TryFrom<String> for ChannelStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for ChannelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "duplicate" {
            return Ok(ChannelStatus::Duplicate);
        }
        s.parse::<MessageStatus>().map(ChannelStatus::Lifecycle)
    }
}

impl Display for ChannelStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Scheduled,
    Processing,
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Scheduled => "scheduled",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(BatchStatus::Scheduled),
            "processing" => Some(BatchStatus::Processing),
            "completed" => Some(BatchStatus::Completed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_order_is_lifecycle_order() {
        for pair in MessageStatus::ALL.windows(2) {
            assert!(pair[1].is_after(Some(pair[0])));
            assert!(!pair[0].is_after(Some(pair[1])));
        }
    }

    #[test]
    fn unset_status_is_always_earlier() {
        assert!(MessageStatus::SubmissionFailed.is_after(None));
    }

    #[test]
    fn equal_status_is_not_after() {
        assert!(!MessageStatus::Sent.is_after(Some(MessageStatus::Sent)));
    }

    #[test]
    fn channel_status_parses_duplicate_and_lifecycle() {
        assert_eq!("duplicate".parse(), Ok(ChannelStatus::Duplicate));
        assert_eq!(
            "submission_succeeded".parse(),
            Ok(ChannelStatus::Lifecycle(MessageStatus::SubmissionSucceeded))
        );
        assert!("bounced".parse::<ChannelStatus>().is_err());
    }

    #[test]
    fn at_or_past_sent_covers_terminal_states() {
        let statuses: Vec<_> = MessageStatus::at_or_past_sent().collect();
        assert_eq!(
            statuses,
            vec![
                MessageStatus::Sent,
                MessageStatus::Failed,
                MessageStatus::Undelivered,
                MessageStatus::Delivered
            ]
        );
    }
}
