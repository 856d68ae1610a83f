//! Worker pools draining the SMS and webhook job queues.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Error, Result};
use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    buffer::ResultBuffer,
    dispatch::{sms::SmsService, webhook::WebhookService},
    error::DispatchError,
    models::{
        job::{FailOutcome, Job},
        outcome::{DeliveryStatus, ResultKind},
    },
    queue::JobQueue,
};

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// `Err` hands the job back to its queue's retry policy.
    async fn process(&self, job: &Job) -> Result<(), Error>;
}

/// What one worker iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Idle,
    Completed { id: String },
    Failed { id: String, outcome: FailOutcome },
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn JobProcessor>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            concurrency,
            poll_interval,
        }
    }

    /// Reserves and processes at most one job.
    pub async fn run_once(&self) -> Result<JobRun, Error> {
        run_once(self.queue.as_ref(), self.processor.as_ref()).await
    }

    /// Starts `concurrency` workers. Each one stops at the next idle poll or
    /// after its current job once `shutdown` flips to true.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let queue_name = self.queue.kind();
        info!(queue = %queue_name, concurrency = self.concurrency, "Starting worker pool");

        (0..self.concurrency)
            .map(|worker_id| {
                let queue = self.queue.clone();
                let processor = self.processor.clone();
                let poll_interval = self.poll_interval;
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    worker_loop(worker_id, queue, processor, poll_interval, shutdown).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn JobProcessor>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = queue.kind();
    debug!(queue = %kind, worker_id, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match run_once(queue.as_ref(), processor.as_ref()).await {
            Ok(JobRun::Idle) => true,
            Ok(_) => false,
            Err(e) => {
                error!(queue = %kind, worker_id, error = %e, "Worker iteration failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    debug!(queue = %kind, worker_id, "Worker stopped");
}

async fn run_once(queue: &dyn JobQueue, processor: &dyn JobProcessor) -> Result<JobRun, Error> {
    let Some(job) = queue.reserve().await? else {
        return Ok(JobRun::Idle);
    };

    debug!(queue = %job.queue, job_id = %job.id, attempt = job.attempt, "Processing job");

    match processor.process(&job).await {
        Ok(()) => {
            // Unsettled jobs go back to the queue when their lease expires.
            queue
                .complete(&job)
                .await
                .with_context(|| format!("Job {} processed but not settled", job.id))?;
            debug!(queue = %job.queue, job_id = %job.id, "Job completed");
            Ok(JobRun::Completed { id: job.id })
        }
        Err(e) => {
            let outcome = queue
                .fail(&job, &e.to_string())
                .await
                .with_context(|| format!("Job {} failed but not settled", job.id))?;
            match outcome {
                FailOutcome::Retrying { delay_ms } => warn!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempt = job.attempt,
                    delay_ms,
                    error = %e,
                    "Job failed, scheduled for retry"
                ),
                FailOutcome::Superseded => info!(
                    queue = %job.queue,
                    job_id = %job.id,
                    error = %e,
                    "Job failed, newer submission takes over"
                ),
                FailOutcome::Failed => error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempts = job.attempt,
                    error = %e,
                    "Job failed permanently"
                ),
            }
            Ok(JobRun::Failed { id: job.id, outcome })
        }
    }
}

fn undelivered(target: &str, status: DeliveryStatus, http_status: u16) -> Error {
    DispatchError::Undelivered {
        target: target.to_string(),
        status,
        http_status,
    }
    .into()
}

pub struct SmsJobProcessor {
    sms: Arc<SmsService>,
    buffer: ResultBuffer,
}

impl SmsJobProcessor {
    pub fn new(sms: Arc<SmsService>, buffer: ResultBuffer) -> Self {
        Self { sms, buffer }
    }
}

#[async_trait]
impl JobProcessor for SmsJobProcessor {
    async fn process(&self, job: &Job) -> Result<(), Error> {
        let outcome = self.sms.send_notification_sms(&job.payload).await?;

        // The message may already be on the handset; never fail the job here.
        if let Err(e) = self.buffer.push(ResultKind::Sms, &outcome).await {
            error!(job_id = %job.id, error = %e, "Failed to buffer SMS outcome");
        }

        if outcome.delivery_status != DeliveryStatus::Delivered {
            return Err(undelivered(
                &outcome.url,
                outcome.delivery_status,
                outcome.response_status,
            ));
        }

        Ok(())
    }
}

pub struct WebhookJobProcessor {
    webhook: Arc<WebhookService>,
    buffer: ResultBuffer,
}

impl WebhookJobProcessor {
    pub fn new(webhook: Arc<WebhookService>, buffer: ResultBuffer) -> Self {
        Self { webhook, buffer }
    }
}

#[async_trait]
impl JobProcessor for WebhookJobProcessor {
    async fn process(&self, job: &Job) -> Result<(), Error> {
        let Some(outcome) = self.webhook.send_webhook_notification(&job.payload).await? else {
            return Ok(());
        };

        if let Err(e) = self.buffer.push(ResultKind::Webhook, &outcome).await {
            error!(job_id = %job.id, error = %e, "Failed to buffer webhook outcome");
        }

        if outcome.delivery_status != DeliveryStatus::Delivered {
            return Err(undelivered(
                &outcome.url,
                outcome.delivery_status,
                outcome.response_status,
            ));
        }

        Ok(())
    }
}
