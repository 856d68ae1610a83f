use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::{StreamExt, stream::BoxStream};
use lapin::{
    Channel, Connection, ConnectionProperties, Event,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions,
    },
    types::FieldTable,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::broker::{BrokerChannel, BrokerConnector, BrokerMessage};

pub struct RabbitMqConnector {
    url: String,
    prefetch_count: u16,
}

impl RabbitMqConnector {
    pub fn new(url: &str, prefetch_count: u16) -> Self {
        Self {
            url: url.to_string(),
            prefetch_count,
        }
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, Error> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        info!("RabbitMQ connection established");

        // Connection and channel errors both surface as events on the connection.
        let (closed_tx, closed_rx) = watch::channel(false);
        let mut events = connection.events_listener().boxed();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Event::Error(e) => {
                        error!(error = %e, "RabbitMQ connection error");
                        break;
                    }
                    other => debug!(event = ?other, "RabbitMQ connection event"),
                }
            }
            let _ = closed_tx.send(true);
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        // One prefetch window shared by every consumer on this channel.
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions { global: true })
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        info!(prefetch_count = self.prefetch_count, "RabbitMQ channel ready");

        Ok(Arc::new(RabbitMqChannel {
            connection,
            channel,
            closed: closed_rx,
        }))
    }
}

pub struct RabbitMqChannel {
    connection: Connection,
    channel: Channel,
    closed: watch::Receiver<bool>,
}

fn to_message(delivery: Delivery) -> BrokerMessage {
    BrokerMessage {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        properties: delivery.properties,
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Result<BrokerMessage>>, Error> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer for {}: {}", queue, e))?;

        Ok(consumer
            .map(|delivery| delivery.map(to_message).map_err(Error::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), Error> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to cancel consumer {}: {}", consumer_tag, e))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| anyhow!("Failed to reject message: {}", e))
    }

    async fn publish(&self, message: &BrokerMessage) -> Result<(), Error> {
        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                message.properties.clone(),
            )
            .await
            .map_err(|e| anyhow!("Failed to republish message: {}", e))?;

        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), Error> {
        self.channel
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| anyhow!("Failed to close RabbitMQ channel: {}", e))?;
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| anyhow!("Failed to close RabbitMQ connection: {}", e))?;

        info!("RabbitMQ connection closed");
        Ok(())
    }
}
