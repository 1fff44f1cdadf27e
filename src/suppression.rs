use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::StoreError,
    models::{message::Channel, template::RenderedContent},
    store::MessageStore,
};

/// Stable hash over recipient, channel and rendered content.
///
/// Each field is length-prefixed so that no two distinct inputs share the
/// same byte stream.
pub fn fingerprint(recipient_key: &str, channel: Channel, content: &RenderedContent) -> String {
    let mut hasher = Sha256::new();
    let subject = content.subject.as_deref().unwrap_or("");

    for field in [recipient_key, channel.as_str(), subject, content.body.as_str()] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// Marks fingerprints whose send is in flight, so that concurrent identical
/// sends are suppressed before either has committed its outcome.
#[async_trait]
pub trait ClaimRegistry: Send + Sync {
    /// Returns `true` when the caller now owns the claim.
    async fn try_claim(&self, fingerprint: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn release(&self, fingerprint: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryClaims {
    claims: Mutex<HashMap<String, Instant>>,
}

impl MemoryClaims {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClaimRegistry for MemoryClaims {
    async fn try_claim(&self, fingerprint: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut claims = self.claims.lock().await;
        let now = Instant::now();
        claims.retain(|_, expires_at| *expires_at > now);

        if claims.contains_key(fingerprint) {
            return Ok(false);
        }
        claims.insert(fingerprint.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.claims.lock().await.remove(fingerprint);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Nothing matching was sent or is in flight; the caller holds the claim
    /// and must release it once the outcome is persisted.
    Clear { fingerprint: String },
    Suppressed { fingerprint: String },
}

pub struct DuplicateSuppressionIndex {
    messages: Arc<dyn MessageStore>,
    claims: Arc<dyn ClaimRegistry>,
    window: chrono::Duration,
    claim_ttl: Duration,
}

impl DuplicateSuppressionIndex {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        claims: Arc<dyn ClaimRegistry>,
        window: Duration,
        claim_ttl: Duration,
    ) -> Self {
        info!(window_seconds = window.as_secs(), "Duplicate suppression index initialized");

        Self {
            messages,
            claims,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            claim_ttl,
        }
    }

    /// True when an identical send already reached `sent` or later within
    /// the suppression window.
    pub async fn should_suppress(
        &self,
        recipient_key: &str,
        channel: Channel,
        content: &RenderedContent,
    ) -> Result<bool, StoreError> {
        let fingerprint = fingerprint(recipient_key, channel, content);
        self.recently_sent(channel, &fingerprint).await
    }

    /// Checks the window and, if clear, claims the fingerprint for the caller.
    pub async fn check_and_claim(
        &self,
        recipient_key: &str,
        channel: Channel,
        content: &RenderedContent,
    ) -> Result<Gate, StoreError> {
        let fingerprint = fingerprint(recipient_key, channel, content);

        if !self.claims.try_claim(&fingerprint, self.claim_ttl).await? {
            debug!(%fingerprint, %channel, "Identical send already in flight, suppressing");
            return Ok(Gate::Suppressed { fingerprint });
        }

        match self.recently_sent(channel, &fingerprint).await {
            Ok(false) => Ok(Gate::Clear { fingerprint }),
            Ok(true) => {
                self.release(&fingerprint).await;
                debug!(%fingerprint, %channel, "Identical send inside suppression window");
                Ok(Gate::Suppressed { fingerprint })
            }
            Err(e) => {
                self.release(&fingerprint).await;
                Err(e)
            }
        }
    }

    /// Claims expire on their own, so a failed release is only logged.
    pub async fn release(&self, fingerprint: &str) {
        if let Err(e) = self.claims.release(fingerprint).await {
            warn!(error = %e, %fingerprint, "Failed to release fingerprint claim");
        }
    }

    async fn recently_sent(&self, channel: Channel, fingerprint: &str) -> Result<bool, StoreError> {
        let since = Utc::now()
            .checked_sub_signed(self.window)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        self.messages.has_recent_send(channel, fingerprint, since).await
    }
}
