use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    broker::consumer::{BrokerConsumer, ConsumerState},
    buffer::ResultBuffer,
    clients::{ResultStore, SharedCache},
    models::{
        health::{HealthCheckResponse, HealthStatus, ServiceHealth},
        outcome::ResultKind,
    },
    queue::JobQueue,
};

pub struct HealthChecker {
    consumer: BrokerConsumer,
    cache: Arc<dyn SharedCache>,
    store: Arc<dyn ResultStore>,
    queues: Vec<Arc<dyn JobQueue>>,
    buffer: ResultBuffer,
}

impl HealthChecker {
    pub fn new(
        consumer: BrokerConsumer,
        cache: Arc<dyn SharedCache>,
        store: Arc<dyn ResultStore>,
        queues: Vec<Arc<dyn JobQueue>>,
        buffer: ResultBuffer,
    ) -> Self {
        Self {
            consumer,
            cache,
            store,
            queues,
            buffer,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("message_broker".to_string(), self.check_broker());
        checks.insert("cache_service".to_string(), self.check_cache().await);
        checks.insert("database".to_string(), self.check_database().await);

        for queue in &self.queues {
            checks.insert(
                format!("queue:{}", queue.kind()),
                Self::check_queue(queue.as_ref()).await,
            );
        }

        checks.insert("result_buffer".to_string(), self.check_buffer().await);

        HealthCheckResponse {
            status: determine_overall_status(&checks),
            timestamp: Utc::now(),
            checks,
        }
    }

    fn check_broker(&self) -> ServiceHealth {
        let state = self.consumer.state();

        let health = match state {
            ConsumerState::Connected => ServiceHealth::healthy(0),
            ConsumerState::Connecting | ConsumerState::Disconnected => {
                ServiceHealth::degraded("Broker connection is being re-established".to_string())
            }
            ConsumerState::Failed => {
                ServiceHealth::unhealthy("Reconnect attempts exhausted".to_string())
            }
            ConsumerState::Closed => ServiceHealth::unhealthy("Consumer is shut down".to_string()),
        };

        health.with_state(state.to_string())
    }

    async fn check_cache(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.cache.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Redis health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Redis health check failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    async fn check_database(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.store.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }

    async fn check_queue(queue: &dyn JobQueue) -> ServiceHealth {
        let start = Instant::now();

        match queue.counts().await {
            Ok(counts) => ServiceHealth::healthy(start.elapsed().as_millis() as u64)
                .with_details(json!(counts)),
            Err(e) => {
                warn!(queue = %queue.kind(), error = %e, "Queue health check failed");
                ServiceHealth::unhealthy(format!("Failed to read queue counts: {}", e))
            }
        }
    }

    async fn check_buffer(&self) -> ServiceHealth {
        let start = Instant::now();

        let sms = self.buffer.len(ResultKind::Sms).await;
        let webhook = self.buffer.len(ResultKind::Webhook).await;

        match (sms, webhook) {
            (Ok(sms), Ok(webhook)) => ServiceHealth::healthy(start.elapsed().as_millis() as u64)
                .with_details(json!({ "sms": sms, "webhook": webhook })),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Result buffer health check failed");
                ServiceHealth::unhealthy(format!("Failed to read buffer backlog: {}", e))
            }
        }
    }
}

pub fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let has_unhealthy = checks
        .values()
        .any(|health| health.status == HealthStatus::Unhealthy);

    let has_degraded = checks
        .values()
        .any(|health| health.status == HealthStatus::Degraded);

    if has_unhealthy {
        HealthStatus::Unhealthy
    } else if has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
