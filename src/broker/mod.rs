//! Inbound message broker.
//!
//! The transport sits behind [`BrokerConnector`] and [`BrokerChannel`] so the
//! consumer's reconnect and retry logic does not depend on a live RabbitMQ.

pub mod consumer;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    BasicProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use serde_json::Value;

use crate::error::HandlerError;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const LAST_ERROR_HEADER: &str = "x-last-error";
pub const LAST_RETRY_TIME_HEADER: &str = "x-last-retry-time";

#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl BrokerMessage {
    /// `x-retry-count` as carried by the broker, 0 when absent or not an integer.
    pub fn retry_count(&self) -> u32 {
        let Some(headers) = self.properties.headers() else {
            return 0;
        };
        let key = ShortString::from(RETRY_COUNT_HEADER);

        let count = match headers.inner().get(&key) {
            Some(AMQPValue::ShortShortInt(v)) => i64::from(*v),
            Some(AMQPValue::ShortShortUInt(v)) => i64::from(*v),
            Some(AMQPValue::ShortInt(v)) => i64::from(*v),
            Some(AMQPValue::ShortUInt(v)) => i64::from(*v),
            Some(AMQPValue::LongInt(v)) => i64::from(*v),
            Some(AMQPValue::LongUInt(v)) => i64::from(*v),
            Some(AMQPValue::LongLongInt(v)) => *v,
            _ => 0,
        };

        u32::try_from(count.max(0)).unwrap_or(u32::MAX)
    }

    /// `messageId` property, then the body's `id` field, then `unknown`.
    pub fn message_id(&self, payload: Option<&Value>) -> String {
        if let Some(id) = self.properties.message_id() {
            return id.as_str().to_string();
        }

        payload
            .and_then(|body| body.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Copy for republishing with the retry headers advanced.
    pub fn with_retry_metadata(&self, error: &str, now_millis: i64) -> Self {
        let mut headers = self.properties.headers().clone().unwrap_or_default();

        headers.insert(
            ShortString::from(RETRY_COUNT_HEADER),
            AMQPValue::LongLongInt(i64::from(self.retry_count()) + 1),
        );
        headers.insert(
            ShortString::from(LAST_ERROR_HEADER),
            AMQPValue::LongString(LongString::from(error)),
        );
        headers.insert(
            ShortString::from(LAST_RETRY_TIME_HEADER),
            AMQPValue::LongLongInt(now_millis),
        );

        Self {
            delivery_tag: self.delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            properties: self.properties.clone().with_headers(headers),
            body: self.body.clone(),
        }
    }
}

pub fn headers_with_retry_count(count: i64) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(RETRY_COUNT_HEADER),
        AMQPValue::LongLongInt(count),
    );
    headers
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Opens a connection and a channel on it.
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Result<BrokerMessage>>>;

    /// Stops deliveries to `consumer_tag`. Its stream ends once the broker
    /// confirms; deliveries already fetched are still yielded.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Publishes `message` to its own exchange and routing key.
    async fn publish(&self, message: &BrokerMessage) -> Result<()>;

    /// Resolves once the underlying connection is lost.
    async fn closed(&self);

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, queue: &str, payload: Value) -> Result<(), HandlerError>;
}
