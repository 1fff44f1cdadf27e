use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use crate::{
    clients::{circuit_breaker::CircuitBreaker, database::PostgresStore, rbmq::RabbitMqClient},
    models::{
        circuit_breaker::CircuitState,
        health::{ComponentHealth, HealthCheckResponse, overall_status},
    },
};

/// Probes whichever backends this process was started with. Components that
/// are not configured report their in-process fallback as healthy.
#[derive(Default)]
pub struct HealthChecker {
    database: Option<Arc<PostgresStore>>,
    redis: Option<MultiplexedConnection>,
    rabbitmq: Option<Arc<RabbitMqClient>>,
    breakers: Vec<CircuitBreaker>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(mut self, database: Arc<PostgresStore>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_redis(mut self, connection: MultiplexedConnection) -> Self {
        self.redis = Some(connection);
        self
    }

    pub fn with_rabbitmq(mut self, rabbitmq: Arc<RabbitMqClient>) -> Self {
        self.rabbitmq = Some(rabbitmq);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breakers.push(breaker);
        self
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = BTreeMap::new();

        checks.insert("database".to_string(), self.check_database().await);
        checks.insert("cache_service".to_string(), self.check_redis().await);
        checks.insert("message_broker".to_string(), self.check_rabbitmq().await);

        for breaker in &self.breakers {
            checks.insert(
                breaker.service_name().to_string(),
                Self::check_circuit_breaker(breaker).await,
            );
        }

        HealthCheckResponse {
            status: overall_status(checks.values()),
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_database(&self) -> ComponentHealth {
        let Some(database) = &self.database else {
            return ComponentHealth::healthy(0).with_backend("memory");
        };

        let start = Instant::now();
        match database.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ComponentHealth::healthy(elapsed).with_backend("postgres")
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ComponentHealth::unhealthy(e.to_string()).with_backend("postgres")
            }
        }
    }

    async fn check_redis(&self) -> ComponentHealth {
        let Some(connection) = &self.redis else {
            return ComponentHealth::healthy(0).with_backend("memory");
        };

        let start = Instant::now();
        let mut conn = connection.clone();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Redis health check passed");
                ComponentHealth::healthy(elapsed).with_backend("redis")
            }
            Err(e) => {
                warn!(error = %e, "Redis ping failed");
                ComponentHealth::unhealthy(format!("Ping failed: {}", e)).with_backend("redis")
            }
        }
    }

    async fn check_rabbitmq(&self) -> ComponentHealth {
        let Some(rabbitmq) = &self.rabbitmq else {
            return ComponentHealth::healthy(0).with_backend("in_process");
        };

        let start = Instant::now();
        match rabbitmq.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "RabbitMQ health check passed");
                ComponentHealth::healthy(elapsed).with_backend("rabbitmq")
            }
            Err(e) => {
                warn!(error = %e, "RabbitMQ health check failed");
                ComponentHealth::unhealthy(e.to_string()).with_backend("rabbitmq")
            }
        }
    }

    async fn check_circuit_breaker(breaker: &CircuitBreaker) -> ComponentHealth {
        match breaker.state().await {
            Ok(state) => {
                debug!(
                    service = breaker.service_name(),
                    circuit_state = %state,
                    "Circuit breaker state checked"
                );

                let health = match state {
                    CircuitState::Closed => ComponentHealth::healthy(0),
                    CircuitState::HalfOpen => {
                        ComponentHealth::degraded("Circuit breaker in recovery mode".to_string())
                    }
                    CircuitState::Open => {
                        ComponentHealth::degraded("Circuit breaker is open".to_string())
                    }
                };
                health.with_circuit_breaker(state.to_string())
            }
            Err(e) => {
                warn!(
                    service = breaker.service_name(),
                    error = %e,
                    "Failed to check circuit breaker state"
                );
                ComponentHealth::unhealthy(format!("Cannot check circuit breaker: {}", e))
            }
        }
    }
}
