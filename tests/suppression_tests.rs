use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use dispatch_service::{
    clients::memory::MemoryStore,
    models::{
        message::{Channel, ChannelRecord, Message, Recipient},
        phone::PhoneNumber,
        status::MessageStatus,
        template::RenderedContent,
    },
    store::MessageStore,
    suppression::{ClaimRegistry, DuplicateSuppressionIndex, Gate, MemoryClaims, fingerprint},
};

use crate::common::WINDOW;

fn sms(body: &str) -> RenderedContent {
    RenderedContent {
        subject: None,
        body: body.to_string(),
    }
}

fn index(store: Arc<MemoryStore>) -> DuplicateSuppressionIndex {
    DuplicateSuppressionIndex::new(store, Arc::new(MemoryClaims::new()), WINDOW, Duration::from_secs(60))
}

async fn store_send(
    store: &MemoryStore,
    body: &str,
    status: MessageStatus,
    age: chrono::Duration,
) -> Result<()> {
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
    message.created_at = Utc::now() - age;
    message.sms = Some(ChannelRecord::new(
        status.into(),
        fingerprint("1234567890", Channel::Sms, &sms(body)),
        body.to_string(),
    ));
    store.insert_message(&message).await?;
    Ok(())
}

/// Test: Fingerprints change with every field that shapes the delivered bytes
#[test]
fn test_fingerprint_covers_recipient_channel_and_content() {
    let base = fingerprint("1234567890", Channel::Sms, &sms("Hi Jo"));

    assert_eq!(base, fingerprint("1234567890", Channel::Sms, &sms("Hi Jo")));
    assert_ne!(base, fingerprint("1234567891", Channel::Sms, &sms("Hi Jo")));
    assert_ne!(base, fingerprint("1234567890", Channel::Email, &sms("Hi Jo")));
    assert_ne!(base, fingerprint("1234567890", Channel::Sms, &sms("Hi Al")));

    let with_subject = RenderedContent {
        subject: Some("Welcome".to_string()),
        body: "Hi Jo".to_string(),
    };
    assert_ne!(base, fingerprint("1234567890", Channel::Sms, &with_subject));
}

/// Test: Only sends at or past `sent` within the window suppress
#[tokio::test]
async fn test_should_suppress_respects_status_and_window() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = index(store.clone());

    store_send(&store, "queued", MessageStatus::Queued, chrono::Duration::minutes(1)).await?;
    store_send(&store, "sent", MessageStatus::Sent, chrono::Duration::minutes(1)).await?;
    store_send(&store, "failed", MessageStatus::Failed, chrono::Duration::minutes(1)).await?;
    store_send(&store, "old", MessageStatus::Delivered, chrono::Duration::days(2)).await?;

    assert!(!index.should_suppress("1234567890", Channel::Sms, &sms("queued")).await?);
    assert!(index.should_suppress("1234567890", Channel::Sms, &sms("sent")).await?);
    assert!(index.should_suppress("1234567890", Channel::Sms, &sms("failed")).await?);
    assert!(!index.should_suppress("1234567890", Channel::Sms, &sms("old")).await?);
    assert!(!index.should_suppress("1234567890", Channel::Sms, &sms("never")).await?);

    Ok(())
}

/// Test: A claimed fingerprint suppresses until it is released
#[tokio::test]
async fn test_check_and_claim_holds_fingerprint() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = index(store);

    let first = index.check_and_claim("1234567890", Channel::Sms, &sms("Hi")).await?;
    let Gate::Clear { fingerprint } = first else {
        panic!("first claim should be clear");
    };

    let second = index.check_and_claim("1234567890", Channel::Sms, &sms("Hi")).await?;
    assert!(matches!(second, Gate::Suppressed { .. }));

    index.release(&fingerprint).await;
    let third = index.check_and_claim("1234567890", Channel::Sms, &sms("Hi")).await?;
    assert!(matches!(third, Gate::Clear { .. }));

    Ok(())
}

/// Test: Claims lapse after their TTL
#[tokio::test]
async fn test_memory_claims_expire() -> Result<()> {
    let claims = MemoryClaims::new();

    assert!(claims.try_claim("fp", Duration::from_millis(10)).await?);
    assert!(!claims.try_claim("fp", Duration::from_millis(10)).await?);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(claims.try_claim("fp", Duration::from_millis(10)).await?);

    Ok(())
}

/// Test: Redis claims are exclusive across registry instances
/// Skipped unless REDIS_URL points at a running server
#[tokio::test]
async fn test_redis_claims_are_exclusive() -> Result<()> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        return Ok(());
    };

    let connection = dispatch_service::clients::redis::connect(&url).await?;
    let a = dispatch_service::clients::redis::RedisClaims::new(connection.clone());
    let b = dispatch_service::clients::redis::RedisClaims::new(connection);
    let fp = format!("test-{}", uuid::Uuid::new_v4());

    assert!(a.try_claim(&fp, Duration::from_secs(5)).await?);
    assert!(!b.try_claim(&fp, Duration::from_secs(5)).await?);
    a.release(&fp).await?;
    assert!(b.try_claim(&fp, Duration::from_secs(5)).await?);
    b.release(&fp).await?;

    Ok(())
}
