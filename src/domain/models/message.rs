use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{StoreError, StoreResult};

pub const MAX_CONTENT_LENGTH: usize = 160;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Claimed,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Claimed => "claimed",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MessageStatus::Pending),
            "claimed" => Some(MessageStatus::Claimed),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }

    // claimed -> pending is the recovery edge taken when an expired claim
    // is released; sent and failed accept no further transitions
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        matches!(
            (*self, next),
            (MessageStatus::Pending, MessageStatus::Claimed)
                | (MessageStatus::Pending, MessageStatus::Sent)
                | (MessageStatus::Pending, MessageStatus::Failed)
                | (MessageStatus::Claimed, MessageStatus::Sent)
                | (MessageStatus::Claimed, MessageStatus::Failed)
                | (MessageStatus::Claimed, MessageStatus::Pending)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub phone_number: String,
    pub content: String,
    pub status: MessageStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub phone_number: String,
    pub content: String,
}

impl NewMessage {
    pub fn validate(&self) -> StoreResult<()> {
        if !is_e164_like(&self.phone_number) {
            return Err(StoreError::Validation("invalid phone number".to_string()));
        }
        if self.content.is_empty() {
            return Err(StoreError::Validation(
                "message content cannot be empty".to_string(),
            ));
        }
        if self.content.chars().count() > MAX_CONTENT_LENGTH {
            return Err(StoreError::Validation(
                "message content exceeds maximum length".to_string(),
            ));
        }
        Ok(())
    }
}

// a leading + followed by up to 15 digits, per E.164
fn is_e164_like(value: &str) -> bool {
    match value.strip_prefix('+') {
        Some(digits) => {
            !digits.is_empty() && digits.len() <= 15 && digits.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}
