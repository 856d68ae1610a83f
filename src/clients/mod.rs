//! Outbound infrastructure: the shared cache, the relational store, HTTP
//! senders and the broker connection.

pub mod database;
pub mod health;
pub mod http;
pub mod product;
pub mod rbmq;
pub mod redis;
pub mod sms;
pub mod template;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    event::EventType,
    outcome::{RowBatch, SenderResponse},
    webhook::{ProductNotificationConfig, WebhookRequest, WebhookTarget},
};

/// The subset of Redis this service relies on.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;

    /// Appends to the tail of the list at `key`, returning its new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64>;

    /// Removes and returns the head of the list at `key`.
    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    async fn llen(&self, key: &str) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Inserts every row of `batch` in one transaction. Returns rows written.
    async fn create_many(&self, batch: RowBatch) -> Result<u64>;

    async fn health_check(&self) -> Result<()>;
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn find_notification_config(
        &self,
        keyword: &str,
    ) -> Result<Option<ProductNotificationConfig>>;
}

#[async_trait]
pub trait WebhookConfigSource: Send + Sync {
    /// `Ok(None)` when the merchant has no callback configured.
    async fn webhook_target(
        &self,
        keyword: &str,
        event_type: &EventType,
    ) -> Result<Option<WebhookTarget>>;
}

/// A provider gateway. Transport failures are reported inside the response,
/// not as `Err`.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, msisdn: &str, body: &str) -> Result<SenderResponse>;
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send_webhook(&self, request: &WebhookRequest) -> Result<SenderResponse>;
}
