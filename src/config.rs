use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    batch::DEFAULT_BATCH_LEASE,
    dispatcher::DispatcherConfig,
    models::{circuit_breaker::CircuitBreakerConfig, retry::RetryConfig},
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    /// Absent means the in-memory store.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Absent means in-process fingerprint claims and no circuit breakers.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Absent means batches are expanded by the in-process scheduler.
    #[serde(default)]
    pub rabbitmq_url: Option<String>,

    #[serde(default = "default_task_queue")]
    pub task_queue_name: String,
    #[serde(default = "default_failed_queue")]
    pub failed_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_from_number: String,
    #[serde(default = "default_twilio_api_base_url")]
    pub twilio_api_base_url: String,

    pub mailgun_api_key: String,
    pub mailgun_domain: String,
    pub mailgun_from: String,
    #[serde(default = "default_mailgun_api_base_url")]
    pub mailgun_api_base_url: String,
    #[serde(default)]
    pub mailgun_webhook_signing_key: Option<String>,

    /// Externally visible base URL; SMS callback signatures cover it.
    pub public_base_url: String,

    pub suppression_window_seconds: u64,

    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_seconds: u64,
    #[serde(default = "default_persistence_timeout")]
    pub persistence_timeout_seconds: u64,

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_timeout_seconds: u64,
    pub circuit_breaker_success_threshold: u32,

    pub max_retry_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_backoff_multiplier: u64,

    pub worker_concurrency: usize,

    #[serde(default = "default_batch_poll_interval")]
    pub batch_poll_interval_seconds: u64,

    #[serde(default = "default_batch_lease")]
    pub batch_lease_seconds: u64,

    pub server_port: u16,
}

fn default_task_queue() -> String {
    "dispatch.tasks".to_string()
}

fn default_failed_queue() -> String {
    "dispatch.failed".to_string()
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_twilio_api_base_url() -> String {
    "https://api.twilio.com".to_string()
}

fn default_mailgun_api_base_url() -> String {
    "https://api.mailgun.net".to_string()
}

fn default_provider_timeout() -> u64 {
    15
}

fn default_persistence_timeout() -> u64 {
    5
}

fn default_batch_poll_interval() -> u64 {
    30
}

fn default_batch_lease() -> u64 {
    DEFAULT_BATCH_LEASE.as_secs()
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;

        if config.suppression_window_seconds == 0 {
            return Err(anyhow!("SUPPRESSION_WINDOW_SECONDS must be greater than zero"));
        }

        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            timeout_seconds: self.circuit_breaker_timeout_seconds,
            success_threshold: self.circuit_breaker_success_threshold,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            provider_timeout: self.provider_timeout(),
        }
    }

    pub fn suppression_window(&self) -> Duration {
        Duration::from_secs(self.suppression_window_seconds)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_seconds)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_secs(self.persistence_timeout_seconds)
    }

    /// Claims outlive the slowest provider call so an in-flight send keeps
    /// its fingerprint until its outcome is stored.
    pub fn claim_ttl(&self) -> Duration {
        self.provider_timeout() + self.persistence_timeout() * 2
    }

    pub fn batch_poll_interval(&self) -> Duration {
        Duration::from_secs(self.batch_poll_interval_seconds.max(1))
    }

    /// Never shorter than one row's send, which renews the lease.
    pub fn batch_lease(&self) -> Duration {
        Duration::from_secs(self.batch_lease_seconds).max(self.claim_ttl())
    }

    pub fn sms_callback_url(&self) -> String {
        format!("{}/webhooks/sms/status", self.public_base_url.trim_end_matches('/'))
    }
}
