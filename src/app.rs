use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use futures_util::future::join_all;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

use crate::{
    api::run_api_server,
    broker::consumer::BrokerConsumer,
    buffer::ResultBuffer,
    clients::{
        ProductStore, ResultStore, SharedCache, database::PostgresStore, health::HealthChecker,
        http::HttpClient, product::ProductService, rbmq::RabbitMqConnector, redis::RedisClient,
        sms::GpSmsSender, template::SmsTemplateService,
    },
    config::{Config, QueueBackend},
    dispatch::{sms::SmsService, webhook::WebhookService},
    flusher::BatchFlusher,
    models::{event::PaymentProvider, job::QueueKind, outcome::ResultKind},
    notification::NotificationService,
    queue::{JobQueue, memory::MemoryJobQueue, redis::RedisJobQueue},
    workers::{SmsJobProcessor, WebhookJobProcessor, WorkerPool},
};

/// Every long-lived component, wired explicitly.
pub struct App {
    config: Config,
    consumer: BrokerConsumer,
    notifications: Arc<NotificationService>,
    sms_pool: WorkerPool,
    webhook_pool: WorkerPool,
    sms_flusher: Arc<BatchFlusher>,
    webhook_flusher: Arc<BatchFlusher>,
    health_checker: HealthChecker,
}

impl App {
    /// Connects to Redis, Postgres and the broker. Any failure here is fatal.
    pub async fn bootstrap(config: Config) -> Result<Self, Error> {
        let retry_config = config.retry_config();

        let redis = RedisClient::connect(&config.redis_url, &retry_config).await?;
        let cache: Arc<dyn SharedCache> = Arc::new(redis.clone());

        let postgres = Arc::new(PostgresStore::connect(&config.database_url, &retry_config).await?);
        let store: Arc<dyn ResultStore> = postgres.clone();
        let products: Arc<dyn ProductStore> = postgres;

        let (sms_queue, webhook_queue): (Arc<dyn JobQueue>, Arc<dyn JobQueue>) =
            match config.queue_backend {
                QueueBackend::Redis => (
                    Arc::new(RedisJobQueue::new(
                        QueueKind::Sms,
                        &config.queue_key_prefix,
                        config.sms_retry_policy(),
                        redis.connection(),
                    )
                    .with_lease(config.job_lease())),
                    Arc::new(RedisJobQueue::new(
                        QueueKind::Webhook,
                        &config.queue_key_prefix,
                        config.webhook_retry_policy(),
                        redis.connection(),
                    )
                    .with_lease(config.job_lease())),
                ),
                QueueBackend::Memory => (
                    Arc::new(
                        MemoryJobQueue::new(QueueKind::Sms, config.sms_retry_policy())
                            .with_lease(config.job_lease()),
                    ),
                    Arc::new(
                        MemoryJobQueue::new(QueueKind::Webhook, config.webhook_retry_policy())
                            .with_lease(config.job_lease()),
                    ),
                ),
            };
        info!(backend = ?config.queue_backend, "Job queues ready");

        let buffer = ResultBuffer::new(
            cache.clone(),
            &config.sms_results_key,
            &config.webhook_results_key,
        );

        let gp_sender = GpSmsSender::new(
            HttpClient::new(Duration::from_millis(config.gp_timeout_ms))?,
            &config.gp_base_url,
            &config.gp_basic_auth_user,
            &config.gp_basic_auth_pass,
        );
        let sms_service = Arc::new(
            SmsService::new(SmsTemplateService::default())
                .with_sender(PaymentProvider::Gp, Arc::new(gp_sender)),
        );

        let webhook_service = Arc::new(WebhookService::new(
            Arc::new(ProductService::new(
                products,
                cache.clone(),
                config.webhook_config_cache_ttl_seconds,
            )),
            Arc::new(HttpClient::new(Duration::from_millis(
                config.webhook_timeout_ms,
            ))?),
        ));

        let sms_pool = WorkerPool::new(
            sms_queue.clone(),
            Arc::new(SmsJobProcessor::new(sms_service, buffer.clone())),
            config.sms_worker_concurrency,
            config.worker_poll_interval(),
        );
        let webhook_pool = WorkerPool::new(
            webhook_queue.clone(),
            Arc::new(WebhookJobProcessor::new(webhook_service, buffer.clone())),
            config.webhook_worker_concurrency,
            config.worker_poll_interval(),
        );

        let sms_flusher = Arc::new(BatchFlusher::new(
            ResultKind::Sms,
            buffer.clone(),
            store.clone(),
            config.sms_result_batch_size,
        ));
        let webhook_flusher = Arc::new(BatchFlusher::new(
            ResultKind::Webhook,
            buffer.clone(),
            store.clone(),
            config.webhook_result_batch_size,
        ));

        let consumer = BrokerConsumer::new(
            Arc::new(RabbitMqConnector::new(
                &config.rabbitmq_url,
                config.prefetch_count,
            )),
            config.consumer_settings(),
        );
        consumer.connect().await?;

        let notifications = Arc::new(NotificationService::new(
            sms_queue.clone(),
            webhook_queue.clone(),
        ));

        let health_checker = HealthChecker::new(
            consumer.clone(),
            cache,
            store,
            vec![sms_queue, webhook_queue],
            buffer,
        );

        Ok(Self {
            config,
            consumer,
            notifications,
            sms_pool,
            webhook_pool,
            sms_flusher,
            webhook_flusher,
            health_checker,
        })
    }

    /// Runs until ctrl-c, then stops intake, drains workers and flushes.
    pub async fn run(self) -> Result<(), Error> {
        let (workers_tx, workers_rx) = watch::channel(false);
        let (flushers_tx, flushers_rx) = watch::channel(false);
        let (server_tx, server_rx) = watch::channel(false);

        let mut workers = self.sms_pool.spawn(workers_rx.clone());
        workers.extend(self.webhook_pool.spawn(workers_rx));

        let flushers = vec![
            self.sms_flusher.clone().spawn_scheduler(
                Duration::from_secs(self.config.sms_flush_interval_seconds),
                flushers_rx.clone(),
            ),
            self.webhook_flusher.clone().spawn_scheduler(
                Duration::from_secs(self.config.webhook_flush_interval_seconds),
                flushers_rx,
            ),
        ];

        let port = self.config.server_port;
        let health_checker = self.health_checker;
        let server: JoinHandle<()> = tokio::spawn(async move {
            if let Err(e) = run_api_server(port, health_checker, server_rx).await {
                error!(error = %e, "Health check server failed");
            }
        });

        for queue in [
            &self.config.subscription_queue_name,
            &self.config.renewal_queue_name,
        ] {
            self.consumer
                .consume(queue, self.notifications.clone())
                .await?;
        }

        info!("Notification dispatcher running");

        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");

        if let Err(e) = self.consumer.shutdown().await {
            error!(error = %e, "Broker consumer shutdown failed");
        }

        let _ = workers_tx.send(true);
        join_all(workers).await;
        info!("Worker pools stopped");

        let _ = flushers_tx.send(true);
        join_all(flushers).await;

        let _ = server_tx.send(true);
        let _ = server.await;

        info!("Notification dispatcher stopped");
        Ok(())
    }
}
