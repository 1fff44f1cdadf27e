use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

use crate::{error::StoreError, suppression::ClaimRegistry};

pub async fn connect(redis_url: &str) -> Result<MultiplexedConnection, Error> {
    info!("Connecting to Redis");

    let client = Client::open(redis_url).map_err(|_| anyhow!("Failed to create redis client"))?;

    let connection = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

    info!("Redis connection established");
    Ok(connection)
}

/// In-flight fingerprint claims shared by every worker.
pub struct RedisClaims {
    connection: MultiplexedConnection,
}

impl RedisClaims {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    fn key(fingerprint: &str) -> String {
        format!("dispatch:inflight:{}", fingerprint)
    }
}

#[async_trait]
impl ClaimRegistry for RedisClaims {
    async fn try_claim(&self, fingerprint: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();

        // SET key "processing" NX PX ttl: only the first caller gets "OK".
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(fingerprint))
            .arg("processing")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn release(&self, fingerprint: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(Self::key(fingerprint)).await?;
        Ok(())
    }
}
