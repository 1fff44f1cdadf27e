use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    clients::circuit_breaker::CircuitBreaker,
    config::Config,
    error::SendError,
    gateway::{ChannelGateway, SendReceipt},
    models::{message::Channel, phone::PhoneNumber, retry::RetryConfig},
    utils::{is_retryable_status, retry_with_backoff},
};

#[derive(Debug, Deserialize)]
struct TwilioMessageResponse {
    sid: String,
    status: String,
    #[serde(default)]
    date_created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioErrorResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// Outer error: worth retrying. Inner error: the provider said no.
type Attempt = Result<Result<SendReceipt, Error>, Error>;

pub struct TwilioSmsGateway {
    http_client: Client,
    messages_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
    status_callback_url: Option<String>,
    retry_config: RetryConfig,
    circuit_breaker: Option<CircuitBreaker>,
}

impl TwilioSmsGateway {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let gateway = Self::with_settings(
            &config.twilio_api_base_url,
            &config.twilio_account_sid,
            &config.twilio_auth_token,
            &config.twilio_from_number,
            config.provider_timeout(),
            config.retry_config(),
        )?
        .with_status_callback(config.sms_callback_url());

        Ok(gateway)
    }

    pub fn with_settings(
        api_base_url: &str,
        account_sid: &str,
        auth_token: &str,
        from_number: &str,
        timeout: Duration,
        retry_config: RetryConfig,
    ) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        let messages_url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            api_base_url.trim_end_matches('/'),
            account_sid
        );

        info!(account_sid, "Twilio SMS gateway initialized");

        Ok(Self {
            http_client,
            messages_url,
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
            from_number: from_number.to_string(),
            status_callback_url: None,
            retry_config,
            circuit_breaker: None,
        })
    }

    pub fn with_status_callback(mut self, url: String) -> Self {
        self.status_callback_url = Some(url);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    async fn send_with_retry(&self, form: &[(&'static str, String)]) -> Result<Result<SendReceipt, Error>, Error> {
        retry_with_backoff(&self.retry_config, || self.send_once(form)).await
    }

    async fn send_once(&self, form: &[(&'static str, String)]) -> Attempt {
        let response = self
            .http_client
            .post(&self.messages_url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            // The message was accepted; a retry here would send it twice.
            let body: TwilioMessageResponse = match response.json().await {
                Ok(body) => body,
                Err(e) => return Ok(Err(anyhow!("Failed to parse Twilio response: {}", e))),
            };

            let provider_created_at = body
                .date_created
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            return Ok(Ok(SendReceipt {
                provider_message_id: body.sid,
                provider_status: body.status,
                provider_created_at,
            }));
        }

        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<TwilioErrorResponse>(&text)
            .ok()
            .and_then(|e| match (e.code, e.message) {
                (Some(code), Some(message)) => Some(format!("{} (code {})", message, code)),
                (None, Some(message)) => Some(message),
                _ => None,
            })
            .unwrap_or(text);

        let error = anyhow!("Twilio returned {}: {}", status, detail);
        if is_retryable_status(status) {
            Err(error)
        } else {
            Ok(Err(error))
        }
    }
}

#[async_trait]
impl ChannelGateway for TwilioSmsGateway {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        recipient: &str,
        body: &str,
        _subject: Option<&str>,
    ) -> Result<SendReceipt, SendError> {
        let to = PhoneNumber::parse(recipient)
            .map_err(|e| SendError::new(e.to_string()))?
            .e164();

        debug!(to = %to, "Sending SMS through Twilio");

        let mut form = vec![
            ("To", to),
            ("From", self.from_number.clone()),
            ("Body", body.to_string()),
        ];
        if let Some(callback) = &self.status_callback_url {
            form.push(("StatusCallback", callback.clone()));
        }

        let result = match &self.circuit_breaker {
            Some(breaker) => breaker.call(|| self.send_with_retry(&form)).await,
            None => self.send_with_retry(&form).await,
        };

        result
            .and_then(|inner| inner)
            .map_err(|e| SendError::new(e.to_string()))
    }
}
