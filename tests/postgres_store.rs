// Run against a scratch database, serially:
//   cargo test --test postgres_store -- --ignored --test-threads=1
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::TryStreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions};

use message_store::application::bootstrap::sample_messages;
use message_store::domain::errors::StoreError;
use message_store::domain::models::{Message, MessageStatus, NewMessage};
use message_store::domain::repositories::{MessageStore, StatusQuery};
use message_store::infrastructure::repositories::postgres::PostgresMessageStore;

async fn connect_store() -> (PostgresMessageStore, PgPool) {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to postgres");
    let store = PostgresMessageStore::new(pool.clone());
    store.initialize().await.expect("initialize schema");
    sqlx::query("TRUNCATE messages")
        .execute(&pool)
        .await
        .expect("truncate messages");
    (store, pool)
}

fn new_message(phone_number: &str, content: &str) -> NewMessage {
    NewMessage {
        phone_number: phone_number.to_string(),
        content: content.to_string(),
    }
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance (DATABASE_URL)"]
async fn schema_bootstrap_is_idempotent() {
    let (store, pool) = connect_store().await;

    store.initialize().await.unwrap();
    store.initialize().await.unwrap();

    assert_eq!(store.seed_if_empty(sample_messages()).await.unwrap(), 5);
    assert_eq!(store.seed_if_empty(sample_messages()).await.unwrap(), 0);

    let indexes: Vec<String> =
        sqlx::query_scalar("SELECT indexname FROM pg_indexes WHERE tablename = 'messages'")
            .fetch_all(&pool)
            .await
            .unwrap();
    for expected in [
        "idx_messages_status_created_at",
        "idx_messages_status_sent_at",
        "idx_messages_message_id",
    ] {
        assert!(
            indexes.iter().any(|name| name == expected),
            "missing index {expected}"
        );
    }
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance (DATABASE_URL)"]
async fn initialize_rejects_an_index_with_a_conflicting_definition() {
    let (store, pool) = connect_store().await;

    // a non-unique index squatting on the provider-id index name
    sqlx::query("DROP INDEX idx_messages_message_id")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("CREATE INDEX idx_messages_message_id ON messages (message_id)")
        .execute(&pool)
        .await
        .unwrap();

    let result = store.initialize().await;
    match result {
        Err(err @ StoreError::AlreadyExists(_)) => assert!(!err.is_transient()),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }

    // with the squatter gone the same call succeeds and restores the schema
    sqlx::query("DROP INDEX idx_messages_message_id")
        .execute(&pool)
        .await
        .unwrap();
    store.initialize().await.unwrap();

    let unique: bool = sqlx::query_scalar(
        "SELECT indisunique FROM pg_index WHERE indexrelid = 'idx_messages_message_id'::regclass",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(unique);
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance (DATABASE_URL)"]
async fn enqueue_round_trips_through_the_table() {
    let (store, _pool) = connect_store().await;

    let message = store
        .enqueue(new_message("+905551111111", "hello"))
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Pending);

    let stored = store.get(message.id).await.unwrap().expect("stored");
    assert_eq!(stored.phone_number, "+905551111111");
    assert_eq!(stored.content, "hello");
    assert_eq!(stored.status, MessageStatus::Pending);
    assert!(stored.sent_at.is_none());
    assert!(stored.message_id.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs a PostgreSQL instance (DATABASE_URL)"]
async fn concurrent_claims_have_a_single_winner() {
    let (store, _pool) = connect_store().await;
    let store = Arc::new(store);
    let message = store
        .enqueue(new_message("+905551111111", "contested"))
        .await
        .unwrap();
    let cutoff = Utc::now();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_pending_batch(1, cutoff).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        let batch = handle.await.unwrap();
        if !batch.is_empty() {
            assert_eq!(batch[0].id, message.id);
            assert_eq!(batch[0].status, MessageStatus::Claimed);
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance (DATABASE_URL)"]
async fn claims_drain_oldest_first() {
    let (store, _pool) = connect_store().await;

    let mut stored = Vec::new();
    for digit in 1..=3 {
        if digit > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let phone = format!("+90555{}", digit.to_string().repeat(7));
        stored.push(store.enqueue(new_message(&phone, "queued")).await.unwrap());
    }

    let first_batch = store.claim_pending_batch(2, Utc::now()).await.unwrap();
    assert_eq!(first_batch.len(), 2);
    assert_eq!(first_batch[0].id, stored[0].id);
    assert_eq!(first_batch[1].id, stored[1].id);

    let second_batch = store.claim_pending_batch(2, Utc::now()).await.unwrap();
    assert_eq!(second_batch.len(), 1);
    assert_eq!(second_batch[0].id, stored[2].id);

    assert!(store.claim_pending_batch(2, Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance (DATABASE_URL)"]
async fn duplicate_provider_ids_surface_already_exists() {
    let (store, _pool) = connect_store().await;
    let first = store
        .enqueue(new_message("+905551111111", "first"))
        .await
        .unwrap();
    let second = store
        .enqueue(new_message("+905552222222", "second"))
        .await
        .unwrap();

    store.mark_sent(first.id, "sm-dup", Utc::now()).await.unwrap();

    let result = store.mark_sent(second.id, "sm-dup", Utc::now()).await;
    match result {
        Err(err @ StoreError::AlreadyExists(_)) => assert!(!err.is_transient()),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }

    let stored = store.get(second.id).await.unwrap().expect("stored");
    assert_eq!(stored.status, MessageStatus::Pending);
    assert!(stored.message_id.is_none());
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance (DATABASE_URL)"]
async fn transition_guards_hold_across_requests() {
    let (store, _pool) = connect_store().await;
    let message = store
        .enqueue(new_message("+905551111111", "doomed"))
        .await
        .unwrap();

    store.mark_failed(message.id, "invalid number").await.unwrap();
    // replaying the same failure is fine
    store.mark_failed(message.id, "invalid number").await.unwrap();

    let result = store.mark_sent(message.id, "sm-1", Utc::now()).await;
    assert!(matches!(
        result,
        Err(StoreError::InvalidTransition {
            from: MessageStatus::Failed,
            ..
        })
    ));

    let stored = store.get(message.id).await.unwrap().expect("stored");
    assert_eq!(stored.status, MessageStatus::Failed);
    assert_eq!(stored.status_reason.as_deref(), Some("invalid number"));
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance (DATABASE_URL)"]
async fn sent_queries_come_back_newest_first() {
    let (store, _pool) = connect_store().await;
    let base = Utc::now();

    for i in 0..3 {
        let phone = format!("+90555{}", (i + 1).to_string().repeat(7));
        let message = store.enqueue(new_message(&phone, "windowed")).await.unwrap();
        store
            .mark_sent(
                message.id,
                &format!("sm-{i}"),
                base + chrono::Duration::minutes(i),
            )
            .await
            .unwrap();
    }

    let sent: Vec<Message> = store
        .query_by_status(StatusQuery::new(MessageStatus::Sent))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(sent.len(), 3);
    assert!(sent.windows(2).all(|w| w[0].sent_at > w[1].sent_at));

    let mut query = StatusQuery::new(MessageStatus::Sent);
    query.sent_after = Some(base + chrono::Duration::minutes(1));
    query.limit = Some(1);
    let windowed: Vec<Message> = store
        .query_by_status(query)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(windowed.len(), 1);
    assert_eq!(windowed[0].message_id.as_deref(), Some("sm-2"));
}

#[tokio::test]
#[ignore = "needs a PostgreSQL instance (DATABASE_URL)"]
async fn released_claims_return_to_the_pool() {
    let (store, _pool) = connect_store().await;
    let message = store
        .enqueue(new_message("+905551111111", "orphaned"))
        .await
        .unwrap();

    assert_eq!(store.claim_pending_batch(1, Utc::now()).await.unwrap().len(), 1);
    assert_eq!(
        store
            .release_expired_claims(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(store.release_expired_claims(Utc::now()).await.unwrap(), 1);

    let reclaimed = store.claim_pending_batch(1, Utc::now()).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, message.id);
}
