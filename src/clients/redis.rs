use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

use crate::{clients::SharedCache, models::retry::RetryConfig, utils::retry_with_backoff};

#[derive(Clone)]
pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    pub async fn connect(redis_url: &str, retry_config: &RetryConfig) -> Result<Self, Error> {
        info!("Connecting to Redis...");

        let client =
            Client::open(redis_url).map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = retry_with_backoff(retry_config, || {
            let client = client.clone();
            async move { client.get_multiplexed_async_connection().await }
        })
        .await
        .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self { connection })
    }

    /// Shared handle for components that issue their own commands.
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl SharedCache for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get(key)
            .await
            .map_err(|e| anyhow!("Failed to get cached value {}: {}", key, e))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds)
            .await
            .map_err(|e| anyhow!("Failed to set cached value {}: {}", key, e))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        conn.rpush(key, value)
            .await
            .map_err(|e| anyhow!("Failed to push to list {}: {}", key, e))
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        conn.lpop(key, None)
            .await
            .map_err(|e| anyhow!("Failed to pop from list {}: {}", key, e))
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        conn.llen(key)
            .await
            .map_err(|e| anyhow!("Failed to read length of list {}: {}", key, e))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.ping::<String>()
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("Redis ping failed: {}", e))
    }
}
