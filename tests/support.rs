use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::{StreamExt, stream::BoxStream};
use lapin::{BasicProperties, types::FieldTable};
use notification_dispatcher::{
    broker::{BrokerChannel, BrokerConnector, BrokerMessage, MessageHandler},
    clients::{ResultStore, SharedCache},
    error::HandlerError,
    models::{
        event::{EventType, NotificationEvent, PaymentProvider},
        outcome::RowBatch,
    },
};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};

pub fn sample_event(event_type: EventType, subscription_id: &str) -> NotificationEvent {
    NotificationEvent {
        id: format!("evt-{}", subscription_id),
        source: "dcb-billing-service".to_string(),
        subscription_id: subscription_id.to_string(),
        merchant_transaction_id: format!("mtx-{}", subscription_id),
        keyword: "GAMES".to_string(),
        msisdn: "8801700000000".to_string(),
        payment_provider: PaymentProvider::Gp,
        event_type,
        amount: 5.0,
        currency: "BDT".to_string(),
        billing_cycle_days: 30,
        metadata: None,
        timestamp: 1_700_000_000_000,
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
pub struct MemoryCache {
    values: Mutex<HashMap<String, String>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pub fail_pushes: AtomicBool,
    pub gets: AtomicU32,
}

impl MemoryCache {
    pub fn list(&self, key: &str) -> Vec<String> {
        self.lists
            .lock()
            .unwrap()
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl_seconds: u64) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(anyhow!("cache unavailable"));
        }
        let mut lists = self.lists.lock().unwrap();
        let list = lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .lists
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|list| list.pop_front()))
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        Ok(self
            .lists
            .lock()
            .unwrap()
            .get(key)
            .map(|list| list.len() as u64)
            .unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every batch handed to it. Can be told to fail or to block until
/// released.
#[derive(Default)]
pub struct RecordingStore {
    pub batches: Mutex<Vec<RowBatch>>,
    pub fail: AtomicBool,
    pub hold: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl RecordingStore {
    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn rows(&self) -> usize {
        self.batches.lock().unwrap().iter().map(RowBatch::len).sum()
    }
}

#[async_trait]
impl ResultStore for RecordingStore {
    async fn create_many(&self, batch: RowBatch) -> Result<u64> {
        if self.hold.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let rows = batch.len() as u64;
        self.batches.lock().unwrap().push(batch);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("connection reset by peer"));
        }
        Ok(rows)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Fails its first `failures` calls, then succeeds.
pub struct ScriptedHandler {
    pub calls: AtomicU32,
    pub failures: u32,
    pub seen: Mutex<Vec<(String, Value)>>,
}

impl ScriptedHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, queue: &str, payload: Value) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((queue.to_string(), payload));
        if call < self.failures {
            return Err(HandlerError::Failed(anyhow!("downstream unavailable")));
        }
        Ok(())
    }
}

pub fn broker_message(tag: u64, body: &[u8], headers: Option<FieldTable>) -> BrokerMessage {
    let mut properties = BasicProperties::default();
    if let Some(headers) = headers {
        properties = properties.with_headers(headers);
    }
    BrokerMessage {
        delivery_tag: tag,
        exchange: "notifications".to_string(),
        routing_key: "notifications.renewal".to_string(),
        properties,
        body: body.to_vec(),
    }
}

type DeliverySender = mpsc::UnboundedSender<Result<BrokerMessage>>;

pub struct FakeChannel {
    pub consumed: Mutex<Vec<String>>,
    pub acks: Mutex<Vec<u64>>,
    pub nacks: Mutex<Vec<(u64, bool)>>,
    pub published: Mutex<Vec<BrokerMessage>>,
    pub fail_publish: AtomicBool,
    pub closed_calls: AtomicU32,
    pub cancelled: Mutex<Vec<String>>,
    deliveries: Mutex<HashMap<String, Vec<(String, DeliverySender)>>>,
    next_tag: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Default for FakeChannel {
    fn default() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            consumed: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            closed_calls: AtomicU32::new(0),
            cancelled: Mutex::new(Vec::new()),
            deliveries: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed,
        }
    }
}

impl FakeChannel {
    /// Pushes a delivery to the newest consumer of `queue`. Returns its tag.
    pub fn deliver(&self, queue: &str, body: &[u8], headers: Option<FieldTable>) -> Result<u64> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let deliveries = self.deliveries.lock().unwrap();
        let (_, sender) = deliveries
            .get(queue)
            .and_then(|consumers| consumers.last())
            .ok_or_else(|| anyhow!("nobody consumes {}", queue))?;
        sender
            .send(Ok(broker_message(tag, body, headers)))
            .map_err(|_| anyhow!("consumer for {} is gone", queue))?;
        Ok(tag)
    }

    pub fn drop_connection(&self) {
        self.closed.send_replace(true);
    }

    pub fn consumed(&self) -> Vec<String> {
        self.consumed.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.acks.lock().unwrap().clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.nacks.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<BrokerMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Result<BrokerMessage>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumed.lock().unwrap().push(queue.to_string());
        self.deliveries
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push((consumer_tag.to_string(), tx));

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    /// Ends the consumer's stream after whatever it already holds.
    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(consumer_tag.to_string());
        for consumers in self.deliveries.lock().unwrap().values_mut() {
            consumers.retain(|(tag, _)| tag != consumer_tag);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.acks.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.nacks.lock().unwrap().push((delivery_tag, requeue));
        Ok(())
    }

    async fn publish(&self, message: &BrokerMessage) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(anyhow!("channel is blocked"));
        }
        self.published.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<()> {
        self.closed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out a fresh [`FakeChannel`] per successful connect.
#[derive(Default)]
pub struct FakeConnector {
    pub attempts: AtomicU32,
    pub refuse: AtomicBool,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnector {
    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Option<Arc<FakeChannel>> {
        self.channels.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let channel = Arc::new(FakeChannel::default());
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }
}
