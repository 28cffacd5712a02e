use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::MessageStatus;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Invalid status transition for message {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("Message not found: {0}")]
    NotFound(Uuid),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl StoreError {
    // only transport failures are worth a retry; everything else is permanent
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
