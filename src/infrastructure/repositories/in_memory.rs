use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use futures::StreamExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    errors::{StoreError, StoreResult},
    models::{Message, MessageStatus, NewMessage},
    repositories::{MessageStore, MessageStream, StatusQuery},
};

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: Arc<RwLock<HashMap<Uuid, Message>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn pending_message(new_message: NewMessage) -> Message {
    let now = Utc::now();
    Message {
        id: Uuid::new_v4(),
        phone_number: new_message.phone_number,
        content: new_message.content,
        status: MessageStatus::Pending,
        status_reason: None,
        created_at: now,
        updated_at: now,
        sent_at: None,
        message_id: None,
    }
}

fn within_sent_window(message: &Message, query: &StatusQuery) -> bool {
    if query.sent_after.is_none() && query.sent_before.is_none() {
        return true;
    }
    match message.sent_at {
        Some(sent_at) => {
            query.sent_after.is_none_or(|bound| sent_at >= bound)
                && query.sent_before.is_none_or(|bound| sent_at <= bound)
        }
        None => false,
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn initialize(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn seed_if_empty(&self, samples: Vec<NewMessage>) -> StoreResult<u64> {
        let mut messages = self.messages.write().await;
        if !messages.is_empty() {
            return Ok(0);
        }
        let mut inserted = 0;
        for sample in samples {
            sample.validate()?;
            let message = pending_message(sample);
            messages.insert(message.id, message);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn enqueue(&self, new_message: NewMessage) -> StoreResult<Message> {
        new_message.validate()?;
        let message = pending_message(new_message);
        let mut messages = self.messages.write().await;
        messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn claim_pending_batch(
        &self,
        limit: u32,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Message>> {
        // selection and status flip happen under one write lock, which is
        // what makes concurrent claims exclusive
        let mut messages = self.messages.write().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending && m.created_at <= cutoff)
            .map(|m| (m.created_at, m.id))
            .collect();
        due.sort();

        let now = Utc::now();
        let mut claimed = Vec::new();
        for (_, id) in due.into_iter().take(limit as usize) {
            if let Some(message) = messages.get_mut(&id) {
                message.status = MessageStatus::Claimed;
                message.updated_at = now;
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut messages = self.messages.write().await;
        let current = messages.get(&id).ok_or(StoreError::NotFound(id))?;
        match current.status {
            // a replayed acknowledgement, nothing to change
            MessageStatus::Sent
                if current.message_id.as_deref() == Some(provider_message_id) =>
            {
                return Ok(());
            }
            from if !from.can_transition_to(MessageStatus::Sent) => {
                return Err(StoreError::InvalidTransition {
                    id,
                    from,
                    to: MessageStatus::Sent,
                });
            }
            _ => {}
        }

        // the partial unique index on message_id, emulated
        if messages
            .values()
            .any(|other| other.id != id && other.message_id.as_deref() == Some(provider_message_id))
        {
            return Err(StoreError::AlreadyExists(format!(
                "message_id {provider_message_id}"
            )));
        }

        if let Some(message) = messages.get_mut(&id) {
            message.status = MessageStatus::Sent;
            message.status_reason = None;
            message.sent_at = Some(sent_at);
            message.message_id = Some(provider_message_id.to_string());
            message.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> StoreResult<()> {
        let mut messages = self.messages.write().await;
        let Some(message) = messages.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        match message.status {
            MessageStatus::Failed if message.status_reason.as_deref() == Some(reason) => Ok(()),
            from if !from.can_transition_to(MessageStatus::Failed) => {
                Err(StoreError::InvalidTransition {
                    id,
                    from,
                    to: MessageStatus::Failed,
                })
            }
            _ => {
                message.status = MessageStatus::Failed;
                message.status_reason = Some(reason.to_string());
                message.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    async fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> StoreResult<u64> {
        let mut messages = self.messages.write().await;
        let now = Utc::now();
        let mut released = 0;
        for message in messages.values_mut() {
            if message.status == MessageStatus::Claimed && message.updated_at < claimed_before {
                message.status = MessageStatus::Pending;
                message.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Message>> {
        let messages = self.messages.read().await;
        Ok(messages.get(&id).cloned())
    }

    async fn query_by_status(&self, query: StatusQuery) -> StoreResult<MessageStream<'_>> {
        let messages = self.messages.read().await;
        let mut matching: Vec<Message> = messages
            .values()
            .filter(|m| m.status == query.status && within_sent_window(m, &query))
            .cloned()
            .collect();
        match query.status {
            MessageStatus::Sent => {
                matching.sort_by(|a, b| (b.sent_at, b.id).cmp(&(a.sent_at, a.id)))
            }
            _ => matching.sort_by_key(|m| (m.created_at, m.id)),
        }
        if let Some(limit) = query.limit {
            matching.truncate(limit as usize);
        }
        Ok(stream::iter(matching.into_iter().map(Ok)).boxed())
    }
}
