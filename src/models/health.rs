use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, ComponentHealth>,
}

/// Health of one dependency. `backend` names the implementation in use
/// (e.g. `memory` when no database is configured).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            backend: None,
            response_time_ms: Some(response_time_ms),
            circuit_breaker: None,
            error: None,
        }
    }

    pub fn unhealthy(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            backend: None,
            response_time_ms: None,
            circuit_breaker: None,
            error: Some(error),
        }
    }

    pub fn degraded(error: String) -> Self {
        Self {
            status: HealthStatus::Degraded,
            backend: None,
            response_time_ms: None,
            circuit_breaker: None,
            error: Some(error),
        }
    }

    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_string());
        self
    }

    pub fn with_circuit_breaker(mut self, state: String) -> Self {
        self.circuit_breaker = Some(state);
        self
    }
}

/// Any unhealthy component makes the whole service unhealthy; otherwise any
/// degraded component degrades it.
pub fn overall_status<'a>(checks: impl IntoIterator<Item = &'a ComponentHealth>) -> HealthStatus {
    checks
        .into_iter()
        .map(|c| c.status)
        .fold(HealthStatus::Healthy, |acc, status| match (acc, status) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_dominates_degraded() {
        let checks = [
            ComponentHealth::healthy(1),
            ComponentHealth::degraded("open".to_string()),
            ComponentHealth::unhealthy("down".to_string()),
        ];
        assert_eq!(overall_status(&checks), HealthStatus::Unhealthy);
        assert_eq!(overall_status(&checks[..2]), HealthStatus::Degraded);
        assert_eq!(overall_status(&checks[..1]), HealthStatus::Healthy);
    }
}
