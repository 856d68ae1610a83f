use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    broker::consumer::ConsumerSettings,
    models::{
        job::{DEFAULT_LEASE_MS, JobRetryPolicy},
        retry::RetryConfig,
    },
};

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_subscription_queue")]
    pub subscription_queue_name: String,
    #[serde(default = "default_renewal_queue")]
    pub renewal_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_broker_max_retries")]
    pub broker_max_retries: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    pub redis_url: String,
    #[serde(default = "default_queue_backend")]
    pub queue_backend: QueueBackend,
    #[serde(default = "default_queue_key_prefix")]
    pub queue_key_prefix: String,
    #[serde(default = "default_job_attempts")]
    pub sms_job_attempts: u32,
    #[serde(default = "default_job_attempts")]
    pub webhook_job_attempts: u32,
    #[serde(default = "default_job_backoff_ms")]
    pub job_backoff_ms: u64,
    #[serde(default = "default_job_lease_ms")]
    pub job_lease_ms: u64,

    #[serde(default = "default_sms_worker_concurrency")]
    pub sms_worker_concurrency: usize,
    #[serde(default = "default_webhook_worker_concurrency")]
    pub webhook_worker_concurrency: usize,
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    pub database_url: String,

    #[serde(default = "default_sms_results_key")]
    pub sms_results_key: String,
    #[serde(default = "default_webhook_results_key")]
    pub webhook_results_key: String,
    #[serde(default = "default_flush_interval_seconds")]
    pub sms_flush_interval_seconds: u64,
    #[serde(default = "default_flush_interval_seconds")]
    pub webhook_flush_interval_seconds: u64,
    #[serde(default = "default_result_batch_size")]
    pub sms_result_batch_size: usize,
    #[serde(default = "default_result_batch_size")]
    pub webhook_result_batch_size: usize,

    pub gp_base_url: String,
    pub gp_basic_auth_user: String,
    pub gp_basic_auth_pass: String,
    #[serde(default = "default_http_timeout_ms")]
    pub gp_timeout_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub webhook_timeout_ms: u64,
    #[serde(default = "default_webhook_config_cache_ttl_seconds")]
    pub webhook_config_cache_ttl_seconds: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.sms_worker_concurrency == 0 || self.webhook_worker_concurrency == 0 {
            return Err(anyhow!("Worker concurrency must be at least 1"));
        }
        if self.sms_result_batch_size == 0 || self.webhook_result_batch_size == 0 {
            return Err(anyhow!("Result batch size must be at least 1"));
        }
        if self.sms_flush_interval_seconds == 0 || self.webhook_flush_interval_seconds == 0 {
            return Err(anyhow!("Flush interval must be at least 1 second"));
        }
        if self.prefetch_count == 0 {
            return Err(anyhow!("Prefetch count must be at least 1"));
        }
        Ok(())
    }

    /// Bootstrap connection retries for Redis and Postgres.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            max_retries: self.broker_max_retries,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn sms_retry_policy(&self) -> JobRetryPolicy {
        JobRetryPolicy {
            attempts: self.sms_job_attempts,
            backoff_ms: self.job_backoff_ms,
        }
    }

    pub fn webhook_retry_policy(&self) -> JobRetryPolicy {
        JobRetryPolicy {
            attempts: self.webhook_job_attempts,
            backoff_ms: self.job_backoff_ms,
        }
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_millis(self.job_lease_ms)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }
}

fn default_subscription_queue() -> String {
    "notifications.subscription.queue".to_string()
}

fn default_renewal_queue() -> String {
    "notifications.renewal.queue".to_string()
}

fn default_prefetch_count() -> u16 {
    100
}

fn default_broker_max_retries() -> u32 {
    3
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_queue_backend() -> QueueBackend {
    QueueBackend::Redis
}

fn default_queue_key_prefix() -> String {
    "bull".to_string()
}

fn default_job_attempts() -> u32 {
    3
}

fn default_job_backoff_ms() -> u64 {
    1000
}

fn default_job_lease_ms() -> u64 {
    DEFAULT_LEASE_MS
}

fn default_sms_worker_concurrency() -> usize {
    10
}

fn default_webhook_worker_concurrency() -> usize {
    20
}

fn default_worker_poll_interval_ms() -> u64 {
    500
}

fn default_sms_results_key() -> String {
    "notification_sms_results".to_string()
}

fn default_webhook_results_key() -> String {
    "notification_webhook_results".to_string()
}

fn default_flush_interval_seconds() -> u64 {
    30
}

fn default_result_batch_size() -> usize {
    1000
}

fn default_http_timeout_ms() -> u64 {
    5000
}

fn default_webhook_config_cache_ttl_seconds() -> u64 {
    15 * 60
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    10_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_server_port() -> u16 {
    8080
}
