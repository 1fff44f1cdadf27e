use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    clients::circuit_breaker::CircuitBreaker,
    config::Config,
    error::SendError,
    gateway::{ChannelGateway, SendReceipt},
    models::{message::Channel, retry::RetryConfig},
    utils::{is_retryable_status, retry_with_backoff},
};

/// Mailgun does not return a delivery status on submission; accepted mail
/// sits in its queue.
const ACCEPTED_STATUS: &str = "queued";

#[derive(Debug, Deserialize)]
struct MailgunSendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MailgunErrorResponse {
    message: String,
}

pub struct MailgunEmailGateway {
    http_client: Client,
    messages_url: String,
    api_key: String,
    from: String,
    retry_config: RetryConfig,
    circuit_breaker: Option<CircuitBreaker>,
}

impl MailgunEmailGateway {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::with_settings(
            &config.mailgun_api_base_url,
            &config.mailgun_domain,
            &config.mailgun_api_key,
            &config.mailgun_from,
            config.provider_timeout(),
            config.retry_config(),
        )
    }

    pub fn with_settings(
        api_base_url: &str,
        domain: &str,
        api_key: &str,
        from: &str,
        timeout: Duration,
        retry_config: RetryConfig,
    ) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        info!(domain, "Mailgun email gateway initialized");

        Ok(Self {
            http_client,
            messages_url: format!("{}/v3/{}/messages", api_base_url.trim_end_matches('/'), domain),
            api_key: api_key.to_string(),
            from: from.to_string(),
            retry_config,
            circuit_breaker: None,
        })
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    async fn send_with_retry(&self, form: &[(&'static str, String)]) -> Result<Result<SendReceipt, Error>, Error> {
        retry_with_backoff(&self.retry_config, || self.send_once(form)).await
    }

    async fn send_once(&self, form: &[(&'static str, String)]) -> Result<Result<SendReceipt, Error>, Error> {
        let response = self
            .http_client
            .post(&self.messages_url)
            .basic_auth("api", Some(&self.api_key))
            .form(form)
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            let body: MailgunSendResponse = match response.json().await {
                Ok(body) => body,
                Err(e) => return Ok(Err(anyhow!("Failed to parse Mailgun response: {}", e))),
            };

            return Ok(Ok(SendReceipt {
                provider_message_id: body.id.trim_matches(['<', '>']).to_string(),
                provider_status: ACCEPTED_STATUS.to_string(),
                provider_created_at: Utc::now(),
            }));
        }

        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<MailgunErrorResponse>(&text)
            .map(|e| e.message)
            .unwrap_or(text);

        let error = anyhow!("Mailgun returned {}: {}", status, detail);
        if is_retryable_status(status) {
            Err(error)
        } else {
            Ok(Err(error))
        }
    }
}

#[async_trait]
impl ChannelGateway for MailgunEmailGateway {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        recipient: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        debug!(to = %recipient, "Sending email through Mailgun");

        let form = vec![
            ("from", self.from.clone()),
            ("to", recipient.to_string()),
            ("subject", subject.unwrap_or_default().to_string()),
            ("text", body.to_string()),
        ];

        let result = match &self.circuit_breaker {
            Some(breaker) => breaker.call(|| self.send_with_retry(&form)).await,
            None => self.send_with_retry(&form).await,
        };

        result
            .and_then(|inner| inner)
            .map_err(|e| SendError::new(e.to_string()))
    }
}
