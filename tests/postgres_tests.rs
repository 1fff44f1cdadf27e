//! Runs against a live database. Every test is skipped unless DATABASE_URL
//! points at a reachable PostgreSQL server; rows are keyed by fresh ids so
//! the tests can share one database.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use dispatch_service::{
    clients::database::PostgresStore,
    models::{
        batch::MessageBatch,
        message::{Channel, ChannelRecord, Message, Recipient},
        phone::PhoneNumber,
        status::{BatchStatus, ChannelStatus, MessageStatus},
    },
    reconciler::StatusReconciler,
    store::{BatchRepository, MessageStore},
};
use futures_util::future::join_all;
use uuid::Uuid;

async fn connect() -> Result<Option<Arc<PostgresStore>>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        return Ok(None);
    };
    Ok(Some(Arc::new(PostgresStore::connect(&url, Duration::from_secs(5)).await?)))
}

fn sms_message(fingerprint: &str, status: MessageStatus, provider_message_id: Option<String>) -> Result<Message> {
    let recipient = Recipient {
        phone: Some(PhoneNumber::parse("1234567890")?),
        email: None,
    };
    let mut message = Message::new(
        "welcome".to_string(),
        "en".to_string(),
        "A".to_string(),
        recipient,
        None,
    );
    let mut record = ChannelRecord::new(status.into(), fingerprint.to_string(), "Hi Jo".to_string());
    record.provider_message_id = provider_message_id;
    message.sms = Some(record);
    Ok(message)
}

/// Test: Concurrent callbacks on one row settle on the furthest status
#[tokio::test]
async fn test_postgres_callbacks_only_move_forward() -> Result<()> {
    let Some(store) = connect().await? else {
        return Ok(());
    };

    let sid = format!("SM{}", Uuid::new_v4().simple());
    let message = sms_message(
        &format!("fp-{}", Uuid::new_v4()),
        MessageStatus::SubmissionSucceeded,
        Some(sid.clone()),
    )?;
    store.insert_message(&message).await?;

    let reconciler = Arc::new(StatusReconciler::new(store.clone()));
    let handles = [
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Queued,
        MessageStatus::Failed,
        MessageStatus::Undelivered,
    ]
    .into_iter()
    .map(|status| {
        let reconciler = reconciler.clone();
        let sid = sid.clone();
        tokio::spawn(async move {
            reconciler
                .apply_status(&sid, Channel::Sms, status, status.as_str(), None)
                .await
        })
    });

    for outcome in join_all(handles).await {
        outcome??;
    }

    let stored = store.get_message(message.id).await?.expect("message stored");
    assert_eq!(
        stored.sms.map(|r| r.status),
        Some(ChannelStatus::Lifecycle(MessageStatus::Delivered))
    );

    let stale = reconciler
        .apply_status(&sid, Channel::Sms, MessageStatus::Sent, "sent", None)
        .await?;
    assert!(!stale.applied);

    Ok(())
}

/// Test: Only rows at or past `sent` inside the window count as recent sends
#[tokio::test]
async fn test_postgres_recent_send_filters_status_and_window() -> Result<()> {
    let Some(store) = connect().await? else {
        return Ok(());
    };

    let delivered = format!("fp-{}", Uuid::new_v4());
    let queued = format!("fp-{}", Uuid::new_v4());
    store
        .insert_message(&sms_message(&delivered, MessageStatus::Delivered, None)?)
        .await?;
    store
        .insert_message(&sms_message(&queued, MessageStatus::Queued, None)?)
        .await?;

    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    assert!(store.has_recent_send(Channel::Sms, &delivered, an_hour_ago).await?);
    assert!(!store.has_recent_send(Channel::Sms, &queued, an_hour_ago).await?);
    assert!(!store.has_recent_send(Channel::Email, &delivered, an_hour_ago).await?);

    let in_an_hour = Utc::now() + chrono::Duration::hours(1);
    assert!(!store.has_recent_send(Channel::Sms, &delivered, in_an_hour).await?);

    Ok(())
}

/// Test: Batch claims are exclusive until released or until the lease lapses
#[tokio::test]
async fn test_postgres_batch_claims_respect_lease() -> Result<()> {
    let Some(store) = connect().await? else {
        return Ok(());
    };

    let batch = MessageBatch::new("welcome".to_string(), "phone\n1234567890\n".to_string(), None);
    store.insert_batch(&batch).await?;

    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    let claimed = store.claim_batch(batch.id, an_hour_ago).await?.expect("claimable");
    assert_eq!(claimed.status, BatchStatus::Processing);
    assert!(store.claim_batch(batch.id, an_hour_ago).await?.is_none());
    assert!(!store.due_batches(Utc::now(), an_hour_ago).await?.contains(&batch.id));

    store.release_batch(batch.id).await?;
    assert_eq!(
        store.get_batch(batch.id).await?.map(|b| b.status),
        Some(BatchStatus::Scheduled)
    );

    store.claim_batch(batch.id, an_hour_ago).await?.expect("released batch is claimable");
    let lapsed = Utc::now() + chrono::Duration::minutes(1);
    assert!(store.due_batches(Utc::now(), lapsed).await?.contains(&batch.id));
    assert!(store.claim_batch(batch.id, lapsed).await?.is_some());

    store.complete_batch(batch.id, &[], &[]).await?;
    assert!(store.claim_batch(batch.id, lapsed).await?.is_none());

    Ok(())
}

/// Test: Messages expanded from a batch are found again by row
#[tokio::test]
async fn test_postgres_batch_rows_are_recorded() -> Result<()> {
    let Some(store) = connect().await? else {
        return Ok(());
    };

    let batch_id = Uuid::new_v4();
    let mut message = sms_message(&format!("fp-{}", Uuid::new_v4()), MessageStatus::Sent, None)?;
    message.batch_id = Some(batch_id);
    message.batch_row = Some(3);
    store.insert_message(&message).await?;

    assert_eq!(store.batch_row_messages(batch_id).await?, vec![(3, message.id)]);
    assert!(store.batch_row_messages(Uuid::new_v4()).await?.is_empty());

    Ok(())
}
