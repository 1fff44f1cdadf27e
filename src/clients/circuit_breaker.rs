use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use tracing::{debug, info, warn};

use crate::models::circuit_breaker::{CircuitBreakerConfig, CircuitState};

/// Breaker whose state lives in Redis so every worker sees the same
/// provider health.
#[derive(Clone)]
pub struct CircuitBreaker {
    service_name: String,
    connection: MultiplexedConnection,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        service_name: String,
        connection: MultiplexedConnection,
        config: CircuitBreakerConfig,
    ) -> Self {
        info!(service = %service_name, "Circuit breaker initialized");

        Self {
            service_name,
            connection,
            config,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let mut conn = self.connection.clone();

        match self.get_state(&mut conn).await? {
            CircuitState::Open => {
                if self.should_attempt_reset(&mut conn).await? {
                    info!(service = %self.service_name, "Circuit breaker attempting reset");
                    self.set_state(&mut conn, CircuitState::HalfOpen).await?;
                    return self.try_operation(&mut conn, operation).await;
                }
                warn!(service = %self.service_name, "Circuit breaker is open, rejecting request");
                Err(anyhow!("Circuit breaker is open for {}", self.service_name))
            }
            CircuitState::HalfOpen => {
                debug!(service = %self.service_name, "Circuit breaker in half-open state");
                self.try_operation(&mut conn, operation).await
            }
            CircuitState::Closed => self.try_operation(&mut conn, operation).await,
        }
    }

    pub async fn state(&self) -> Result<CircuitState, Error> {
        let mut conn = self.connection.clone();
        self.get_state(&mut conn).await
    }

    async fn try_operation<F, Fut, T>(
        &self,
        conn: &mut MultiplexedConnection,
        operation: F,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        match operation().await {
            Ok(result) => {
                self.record_success(conn).await?;
                Ok(result)
            }
            Err(e) => {
                self.record_failure(conn).await?;
                Err(e)
            }
        }
    }

    async fn record_success(&self, conn: &mut MultiplexedConnection) -> Result<(), Error> {
        let state = self.get_state(conn).await?;

        if state == CircuitState::HalfOpen {
            let successes: u32 = conn.incr(self.key("successes"), 1).await?;
            debug!(
                service = %self.service_name,
                successes,
                threshold = self.config.success_threshold,
                "Circuit breaker success recorded"
            );

            if successes >= self.config.success_threshold {
                self.set_state(conn, CircuitState::Closed).await?;
                conn.del::<_, ()>(vec![self.key("failures"), self.key("successes"), self.key("opened_at")])
                    .await?;
                info!(service = %self.service_name, "Circuit breaker closed after successful recovery");
            }
        } else if state == CircuitState::Closed {
            conn.del::<_, ()>(self.key("failures")).await?;
        }

        Ok(())
    }

    async fn record_failure(&self, conn: &mut MultiplexedConnection) -> Result<(), Error> {
        let state = self.get_state(conn).await?;

        if state == CircuitState::HalfOpen {
            self.open(conn).await?;
            warn!(service = %self.service_name, "Circuit breaker reopened after failed recovery attempt");
            return Ok(());
        }

        let failures_key = self.key("failures");
        let failures: u32 = conn.incr(&failures_key, 1).await?;
        conn.expire::<_, ()>(&failures_key, self.config.timeout_seconds as i64)
            .await?;

        debug!(
            service = %self.service_name,
            failures,
            threshold = self.config.failure_threshold,
            "Circuit breaker failure recorded"
        );

        if failures >= self.config.failure_threshold {
            self.open(conn).await?;
            warn!(
                service = %self.service_name,
                failures,
                "Circuit breaker opened due to consecutive failures"
            );
        }

        Ok(())
    }

    async fn open(&self, conn: &mut MultiplexedConnection) -> Result<(), Error> {
        self.set_state(conn, CircuitState::Open).await?;
        conn.set::<_, _, ()>(self.key("opened_at"), Utc::now().timestamp())
            .await?;
        conn.del::<_, ()>(self.key("successes")).await?;
        Ok(())
    }

    async fn get_state(&self, conn: &mut MultiplexedConnection) -> Result<CircuitState, Error> {
        let value: Option<String> = conn.get(self.key("state")).await?;

        Ok(value
            .map(|s| CircuitState::from_string(&s))
            .unwrap_or(CircuitState::Closed))
    }

    async fn set_state(&self, conn: &mut MultiplexedConnection, state: CircuitState) -> Result<(), Error> {
        conn.set::<_, _, ()>(self.key("state"), state.as_str()).await?;
        Ok(())
    }

    async fn should_attempt_reset(&self, conn: &mut MultiplexedConnection) -> Result<bool, Error> {
        let opened_at: Option<i64> = conn.get(self.key("opened_at")).await?;

        Ok(opened_at.is_some_and(|opened_at| {
            let elapsed = Utc::now().timestamp().saturating_sub(opened_at);
            elapsed >= self.config.timeout_seconds as i64
        }))
    }

    fn key(&self, suffix: &str) -> String {
        format!("circuit:{}:{}", self.service_name, suffix)
    }
}
