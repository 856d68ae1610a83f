use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use futures_util::{StreamExt, stream::BoxStream};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{Mutex, RwLock, oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    broker::{BrokerChannel, BrokerConnector, BrokerMessage, MessageHandler},
    error::HandlerError,
    utils::{epoch_millis, reconnect_delay},
};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub max_retries: u32,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            reconnect_delay: Duration::from_millis(5000),
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Connected,
    /// Shut down on request.
    Closed,
    /// Reconnect attempts exhausted.
    Failed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Connected => "connected",
            ConsumerState::Closed => "closed",
            ConsumerState::Failed => "failed",
        };
        write!(f, "{}", state)
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    /// Unparseable payload, nacked without requeue.
    Discarded,
    /// Republished with `x-retry-count = retry_count`.
    Retried { retry_count: u32 },
    /// Republish failed, the original goes back to the broker.
    Requeued,
    /// Retries spent, nacked without requeue.
    DeadLettered,
}

/// How long a replaced consumer may spend handing back its fetched deliveries.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Subscription {
    queue: String,
    handler: Arc<dyn MessageHandler>,
}

struct Inner {
    connector: Arc<dyn BrokerConnector>,
    settings: ConsumerSettings,
    state: watch::Sender<ConsumerState>,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    consumers: Mutex<HashMap<String, ActiveConsumer>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct ActiveConsumer {
    release: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Consumes the inbound queues, keeps the connection alive and applies the
/// per-message retry protocol.
#[derive(Clone)]
pub struct BrokerConsumer {
    inner: Arc<Inner>,
}

impl BrokerConsumer {
    pub fn new(connector: Arc<dyn BrokerConnector>, settings: ConsumerSettings) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                connector,
                settings,
                state,
                channel: RwLock::new(None),
                subscriptions: Mutex::new(Vec::new()),
                consumers: Mutex::new(HashMap::new()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.inner.state.subscribe()
    }

    /// Single connection attempt. Reconnects after a later drop are handled
    /// internally.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.state() == ConsumerState::Closed {
            return Err(anyhow!("Broker consumer has been shut down"));
        }

        self.inner.set_state(ConsumerState::Connecting);
        info!("Connecting to message broker...");

        let channel = match self.inner.connector.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                self.inner.set_state(ConsumerState::Disconnected);
                return Err(e.context("Failed to connect to message broker"));
            }
        };

        *self.inner.channel.write().await = Some(channel.clone());
        self.inner.set_state(ConsumerState::Connected);
        info!("Message broker connection established");

        self.inner.resubscribe_all(&channel).await;

        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.as_ref().is_none_or(|handle| handle.is_finished()) {
            *supervisor = Some(tokio::spawn(Inner::supervise(self.inner.clone())));
        }

        Ok(())
    }

    /// Registers `handler` for `queue` and starts consuming if connected.
    /// Registering a queue again replaces its handler and keeps its position in
    /// the re-subscription order.
    pub async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<(), Error> {
        if self.state() == ConsumerState::Closed {
            return Err(anyhow!("Broker consumer has been shut down"));
        }

        {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            match subscriptions.iter_mut().find(|sub| sub.queue == queue) {
                Some(existing) => existing.handler = handler.clone(),
                None => subscriptions.push(Subscription {
                    queue: queue.to_string(),
                    handler: handler.clone(),
                }),
            }
        }

        let channel = self.inner.channel.read().await.clone();
        match channel {
            Some(channel) => {
                let subscription = Subscription {
                    queue: queue.to_string(),
                    handler,
                };
                self.inner.start_consuming(&channel, &subscription).await
            }
            None => {
                info!(queue = %queue, "Broker not connected, consumer will start on reconnect");
                Ok(())
            }
        }
    }

    /// Stops consuming and closes the connection. Terminal.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.inner.set_state(ConsumerState::Closed);

        if let Some(supervisor) = self.inner.supervisor.lock().await.take() {
            supervisor.abort();
        }

        self.inner.stop_consumers().await;

        if let Some(channel) = self.inner.channel.write().await.take() {
            channel.close().await?;
        }

        info!("Broker consumer shut down");
        Ok(())
    }
}

impl Inner {
    /// `Closed` absorbs every later transition.
    fn set_state(&self, next: ConsumerState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == ConsumerState::Closed || *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "Broker consumer state change");
            *current = next;
            true
        })
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() == ConsumerState::Closed
    }

    async fn supervise(inner: Arc<Inner>) {
        loop {
            let Some(channel) = inner.channel.read().await.clone() else {
                return;
            };

            channel.closed().await;
            if inner.is_closed() {
                return;
            }

            warn!("Message broker connection lost");
            inner.channel.write().await.take();
            inner.stop_consumers().await;
            inner.set_state(ConsumerState::Disconnected);

            if !inner.reconnect().await {
                return;
            }
        }
    }

    /// Returns false once reconnecting is abandoned.
    async fn reconnect(&self) -> bool {
        let max_attempts = self.settings.max_reconnect_attempts;

        for attempt in 1..=max_attempts {
            let delay = reconnect_delay(self.settings.reconnect_delay, attempt);
            info!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Attempting to reconnect to message broker"
            );

            self.set_state(ConsumerState::Connecting);
            sleep(delay).await;
            if self.is_closed() {
                return false;
            }

            match self.connector.connect().await {
                Ok(channel) => {
                    if self.is_closed() {
                        if let Err(e) = channel.close().await {
                            debug!(error = %e, "Failed to close channel opened during shutdown");
                        }
                        return false;
                    }

                    *self.channel.write().await = Some(channel.clone());
                    self.set_state(ConsumerState::Connected);
                    info!(attempt, "Reconnected to message broker");

                    self.resubscribe_all(&channel).await;
                    return true;
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "Reconnect attempt failed");
                    self.set_state(ConsumerState::Disconnected);
                }
            }
        }

        error!(
            max_attempts,
            "Max reconnect attempts reached, broker consumer needs operator action"
        );
        self.set_state(ConsumerState::Failed);
        false
    }

    async fn resubscribe_all(&self, channel: &Arc<dyn BrokerChannel>) {
        let subscriptions = self.subscriptions.lock().await.clone();

        for subscription in &subscriptions {
            if let Err(e) = self.start_consuming(channel, subscription).await {
                error!(queue = %subscription.queue, error = %e, "Failed to re-subscribe queue");
            }
        }
    }

    async fn start_consuming(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        subscription: &Subscription,
    ) -> Result<(), Error> {
        let consumer_tag = format!("{}-{}", subscription.queue, Uuid::new_v4());
        let deliveries = channel
            .consume(&subscription.queue, &consumer_tag)
            .await
            .map_err(|e| e.context(format!("Failed to consume from {}", subscription.queue)))?;

        let (release, released) = oneshot::channel();
        let task = tokio::spawn(consume_loop(
            channel.clone(),
            subscription.queue.clone(),
            consumer_tag,
            subscription.handler.clone(),
            self.settings.max_retries,
            deliveries,
            released,
        ));

        if let Some(previous) = self
            .consumers
            .lock()
            .await
            .insert(subscription.queue.clone(), ActiveConsumer { release, task })
        {
            // The replaced consumer cancels itself and hands back what it fetched.
            let _ = previous.release.send(());
        }

        info!(queue = %subscription.queue, "Consuming from queue");
        Ok(())
    }

    async fn stop_consumers(&self) {
        for (_, consumer) in self.consumers.lock().await.drain() {
            consumer.task.abort();
        }
    }
}

async fn consume_loop(
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    consumer_tag: String,
    handler: Arc<dyn MessageHandler>,
    max_retries: u32,
    mut deliveries: BoxStream<'static, Result<BrokerMessage>>,
    mut released: oneshot::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut released => None,
            delivery = deliveries.next() => Some(delivery),
        };
        let Some(delivery) = next else {
            release_consumer(channel.as_ref(), &queue, &consumer_tag, deliveries).await;
            return;
        };
        let Some(delivery) = delivery else {
            break;
        };

        match delivery {
            Ok(message) => {
                let channel = channel.clone();
                let queue = queue.clone();
                let handler = handler.clone();

                tokio::spawn(async move {
                    let tag = message.delivery_tag;
                    if let Err(e) =
                        handle_delivery(channel.as_ref(), &queue, handler.as_ref(), max_retries, message)
                            .await
                    {
                        error!(queue = %queue, delivery_tag = tag, error = %e, "Failed to settle delivery");
                    }
                });
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Delivery stream error");
                break;
            }
        }
    }

    debug!(queue = %queue, "Delivery stream ended");
}

/// Cancels a replaced consumer and requeues the deliveries it had fetched but
/// not started, so they stop holding prefetch slots.
async fn release_consumer(
    channel: &dyn BrokerChannel,
    queue: &str,
    consumer_tag: &str,
    mut deliveries: BoxStream<'static, Result<BrokerMessage>>,
) {
    if let Err(e) = channel.cancel(consumer_tag).await {
        warn!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            error = %e,
            "Failed to cancel replaced consumer"
        );
    }

    let drained = timeout(RELEASE_TIMEOUT, async {
        let mut requeued = 0u32;
        while let Some(Ok(message)) = deliveries.next().await {
            match channel.nack(message.delivery_tag, true).await {
                Ok(()) => requeued += 1,
                Err(e) => warn!(
                    queue = %queue,
                    delivery_tag = message.delivery_tag,
                    error = %e,
                    "Failed to requeue delivery of replaced consumer"
                ),
            }
        }
        requeued
    })
    .await;

    match drained {
        Ok(requeued) => info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            requeued,
            "Replaced consumer released"
        ),
        Err(_) => warn!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            "Replaced consumer did not drain in time"
        ),
    }
}

/// Runs the handler for one delivery and settles it with the broker.
pub async fn handle_delivery(
    channel: &dyn BrokerChannel,
    queue: &str,
    handler: &dyn MessageHandler,
    max_retries: u32,
    message: BrokerMessage,
) -> Result<DeliveryOutcome, Error> {
    let tag = message.delivery_tag;
    let retry_count = message.retry_count();

    let payload: Value = match serde_json::from_slice(&message.body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(
                queue = %queue,
                message_id = %message.message_id(None),
                error = %e,
                "Message body is not valid JSON, discarding"
            );
            channel.nack(tag, false).await?;
            return Ok(DeliveryOutcome::Discarded);
        }
    };

    let message_id = message.message_id(Some(&payload));
    debug!(queue = %queue, message_id = %message_id, retry_count, "Processing message");

    match handler.handle(queue, payload).await {
        Ok(()) => {
            channel.ack(tag).await?;
            debug!(queue = %queue, message_id = %message_id, "Message acknowledged");
            Ok(DeliveryOutcome::Acked)
        }
        Err(HandlerError::Decode(e)) => {
            error!(
                queue = %queue,
                message_id = %message_id,
                error = %e,
                "Message payload has the wrong shape, discarding"
            );
            channel.nack(tag, false).await?;
            Ok(DeliveryOutcome::Discarded)
        }
        Err(HandlerError::Failed(e)) if retry_count < max_retries => {
            let next = retry_count + 1;
            warn!(
                queue = %queue,
                message_id = %message_id,
                retry_count = next,
                max_retries,
                error = %e,
                "Message processing failed, retrying"
            );

            let retry = message.with_retry_metadata(&e.to_string(), epoch_millis());
            match channel.publish(&retry).await {
                Ok(()) => {
                    channel.nack(tag, false).await?;
                    Ok(DeliveryOutcome::Retried { retry_count: next })
                }
                Err(publish_err) => {
                    error!(
                        queue = %queue,
                        message_id = %message_id,
                        error = %publish_err,
                        "Failed to republish message for retry, requeueing original"
                    );
                    channel.nack(tag, true).await?;
                    Ok(DeliveryOutcome::Requeued)
                }
            }
        }
        Err(HandlerError::Failed(e)) => {
            error!(
                queue = %queue,
                message_id = %message_id,
                retry_count,
                max_retries,
                error = %e,
                "Max retries exceeded, sending message to dead letter queue"
            );
            channel.nack(tag, false).await?;
            Ok(DeliveryOutcome::DeadLettered)
        }
    }
}
