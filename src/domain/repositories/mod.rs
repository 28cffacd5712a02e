use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::domain::errors::StoreResult;
use crate::domain::models::{Message, MessageStatus, NewMessage};

pub type MessageStream<'a> = BoxStream<'a, StoreResult<Message>>;

#[derive(Debug, Clone)]
pub struct StatusQuery {
    pub status: MessageStatus,
    // sent_after/sent_before compare against sent_at, so a bounded window
    // never matches rows that were not sent
    pub sent_after: Option<DateTime<Utc>>,
    pub sent_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl StatusQuery {
    pub fn new(status: MessageStatus) -> Self {
        Self {
            status,
            sent_after: None,
            sent_before: None,
            limit: None,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn initialize(&self) -> StoreResult<()>;

    async fn seed_if_empty(&self, samples: Vec<NewMessage>) -> StoreResult<u64>;

    async fn enqueue(&self, new_message: NewMessage) -> StoreResult<Message>;

    async fn claim_pending_batch(
        &self,
        limit: u32,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Message>>;

    async fn mark_sent(
        &self,
        id: Uuid,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn mark_failed(&self, id: Uuid, reason: &str) -> StoreResult<()>;

    async fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> StoreResult<u64>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Message>>;

    async fn query_by_status(&self, query: StatusQuery) -> StoreResult<MessageStream<'_>>;
}
