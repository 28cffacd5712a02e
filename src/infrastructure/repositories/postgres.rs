use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::FromRow;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::domain::{
    errors::{StoreError, StoreResult},
    models::{Message, MessageStatus, NewMessage},
    repositories::{MessageStore, MessageStream, StatusQuery},
};

// ASCII "messages"; serializes concurrent first-run schema creation
const BOOTSTRAP_LOCK_KEY: i64 = 0x6d65_7373_6167_6573;

// SQLSTATE for unique_violation
const UNIQUE_VIOLATION: &str = "23505";

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id UUID PRIMARY KEY,
        phone_number TEXT NOT NULL,
        content TEXT NOT NULL,
        status TEXT NOT NULL,
        status_reason TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        sent_at TIMESTAMPTZ,
        message_id TEXT
    )
    "#,
    // oldest-pending-first claims
    r#"CREATE INDEX IF NOT EXISTS idx_messages_status_created_at
       ON messages (status, created_at)"#,
    // recency-ordered audit over sent messages
    r#"CREATE INDEX IF NOT EXISTS idx_messages_status_sent_at
       ON messages (status, sent_at DESC)"#,
    // provider ids are unique only where present
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_message_id
       ON messages (message_id) WHERE message_id IS NOT NULL"#,
];

// pg_get_indexdef renderings of the statements above, schema prefix stripped
const EXPECTED_INDEXES: &[(&str, &str)] = &[
    (
        "idx_messages_status_created_at",
        "CREATE INDEX idx_messages_status_created_at ON messages USING btree (status, created_at)",
    ),
    (
        "idx_messages_status_sent_at",
        "CREATE INDEX idx_messages_status_sent_at ON messages USING btree (status, sent_at DESC)",
    ),
    (
        "idx_messages_message_id",
        "CREATE UNIQUE INDEX idx_messages_message_id ON messages USING btree (message_id) WHERE (message_id IS NOT NULL)",
    ),
];

const CLAIM_SQL: &str = r#"
UPDATE messages
SET status = 'claimed', updated_at = $3
WHERE id IN (
    SELECT id FROM messages
    WHERE status = 'pending'
      AND created_at <= $1
    ORDER BY created_at ASC, id ASC
    FOR UPDATE SKIP LOCKED
    LIMIT $2
)
RETURNING id, phone_number, content, status, status_reason, created_at, updated_at, sent_at, message_id
"#;

// pending/claimed/failed work ordered by age; served by (status, created_at)
const QUERY_BY_AGE_SQL: &str = r#"
SELECT id, phone_number, content, status, status_reason, created_at, updated_at, sent_at, message_id
FROM messages
WHERE status = $1
  AND ($2::timestamptz IS NULL OR sent_at >= $2)
  AND ($3::timestamptz IS NULL OR sent_at <= $3)
ORDER BY created_at ASC, id ASC
LIMIT $4
"#;

// sent messages newest first; served by (status, sent_at DESC)
const QUERY_BY_SENT_AT_SQL: &str = r#"
SELECT id, phone_number, content, status, status_reason, created_at, updated_at, sent_at, message_id
FROM messages
WHERE status = $1
  AND ($2::timestamptz IS NULL OR sent_at >= $2)
  AND ($3::timestamptz IS NULL OR sent_at <= $3)
ORDER BY sent_at DESC, id DESC
LIMIT $4
"#;

#[derive(Clone)]
pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &Config) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn initialize(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(BOOTSTRAP_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        // IF NOT EXISTS keeps whatever index already owns a name, even one
        // with a different definition; bail out instead of running on a
        // schema that does not enforce the contract
        let found: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT indexname, replace(indexdef, schemaname || '.', '') AS indexdef
            FROM pg_indexes
            WHERE tablename = 'messages'
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        for (name, expected) in EXPECTED_INDEXES.iter().copied() {
            let actual = found
                .iter()
                .find(|(indexname, _)| indexname == name)
                .map(|(_, indexdef)| indexdef.as_str());
            match actual {
                Some(indexdef) if indexdef == expected => {}
                Some(indexdef) => {
                    return Err(StoreError::AlreadyExists(format!(
                        "index {name} conflicts with an existing definition: {indexdef}"
                    )));
                }
                None => {
                    return Err(StoreError::Unavailable(anyhow::anyhow!(
                        "index {name} is missing after schema bootstrap"
                    )));
                }
            }
        }

        tx.commit().await?;
        debug!("messages table and indexes ensured");
        Ok(())
    }

    async fn seed_if_empty(&self, samples: Vec<NewMessage>) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(BOOTSTRAP_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&mut *tx)
            .await?;
        if count > 0 {
            tx.commit().await?;
            return Ok(0);
        }

        let mut inserted = 0;
        for sample in &samples {
            sample.validate()?;
            sqlx::query(
                r#"
                INSERT INTO messages (id, phone_number, content, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&sample.phone_number)
            .bind(&sample.content)
            .bind(MessageStatus::Pending.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            inserted += 1;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn enqueue(&self, new_message: NewMessage) -> StoreResult<Message> {
        new_message.validate()?;
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (id, phone_number, content, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING id, phone_number, content, status, status_reason, created_at, updated_at, sent_at, message_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_message.phone_number)
        .bind(&new_message.content)
        .bind(MessageStatus::Pending.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn claim_pending_batch(
        &self,
        limit: u32,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRecord>(CLAIM_SQL)
            .bind(cutoff)
            .bind(i64::from(limit))
            .bind(Utc::now())
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = rows
            .into_iter()
            .map(Message::try_from)
            .collect::<StoreResult<Vec<_>>>()?;
        // RETURNING emits rows in update order, not subselect order
        claimed.sort_by_key(|message| (message.created_at, message.id));

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed pending messages");
        }
        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'sent', sent_at = $2, message_id = $3, status_reason = NULL, updated_at = $4
            WHERE id = $1
              AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(id)
        .bind(sent_at)
        .bind(provider_message_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        // nothing matched; read the row to tell the caller why
        match self.get(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(message)
                if message.status == MessageStatus::Sent
                    && message.message_id.as_deref() == Some(provider_message_id) =>
            {
                Ok(())
            }
            Some(message) => Err(StoreError::InvalidTransition {
                id,
                from: message.status,
                to: MessageStatus::Sent,
            }),
        }
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'failed', status_reason = $2, updated_at = $3
            WHERE id = $1
              AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.get(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(message)
                if message.status == MessageStatus::Failed
                    && message.status_reason.as_deref() == Some(reason) =>
            {
                Ok(())
            }
            Some(message) => Err(StoreError::InvalidTransition {
                id,
                from: message.status,
                to: MessageStatus::Failed,
            }),
        }
    }

    async fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'pending', updated_at = $2
            WHERE status = 'claimed'
              AND updated_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            debug!(released, "released expired claims back to pending");
        }
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Message>> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, phone_number, content, status, status_reason, created_at, updated_at, sent_at, message_id
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(Message::try_from).transpose()
    }

    async fn query_by_status(&self, query: StatusQuery) -> StoreResult<MessageStream<'_>> {
        let sql = if query.status == MessageStatus::Sent {
            QUERY_BY_SENT_AT_SQL
        } else {
            QUERY_BY_AGE_SQL
        };
        let rows = sqlx::query_as::<_, MessageRecord>(sql)
            .bind(query.status.as_str())
            .bind(query.sent_after)
            .bind(query.sent_before)
            .bind(query.limit.map(i64::from))
            .fetch(&self.pool);
        Ok(rows
            .map(|row| row.map_err(StoreError::from).and_then(Message::try_from))
            .boxed())
    }
}

#[derive(FromRow)]
struct MessageRecord {
    id: Uuid,
    phone_number: String,
    content: String,
    status: String,
    status_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    message_id: Option<String>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = StoreError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let status = MessageStatus::parse(&value.status).ok_or_else(|| {
            StoreError::Unavailable(anyhow::anyhow!("unknown message status {}", value.status))
        })?;
        Ok(Self {
            id: value.id,
            phone_number: value.phone_number,
            content: value.content,
            status,
            status_reason: value.status_reason,
            created_at: value.created_at,
            updated_at: value.updated_at,
            sent_at: value.sent_at,
            message_id: value.message_id,
        })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return StoreError::AlreadyExists(db_err.message().to_string());
            }
        }
        StoreError::Unavailable(err.into())
    }
}
