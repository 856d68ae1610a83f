use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{
    broker::MessageHandler,
    error::HandlerError,
    models::{
        event::NotificationEvent,
        job::{EnqueueOptions, EnqueueOutcome, QueueKind},
    },
    queue::JobQueue,
    router::{priority_for, route},
};

/// Broker handler: turns one lifecycle event into SMS and webhook jobs.
pub struct NotificationService {
    sms_queue: Arc<dyn JobQueue>,
    webhook_queue: Arc<dyn JobQueue>,
}

impl NotificationService {
    pub fn new(sms_queue: Arc<dyn JobQueue>, webhook_queue: Arc<dyn JobQueue>) -> Self {
        Self {
            sms_queue,
            webhook_queue,
        }
    }

    pub fn job_options(event: &NotificationEvent) -> EnqueueOptions {
        EnqueueOptions::new(event.subscription_id.clone(), priority_for(&event.event_type))
    }

    fn queue(&self, kind: QueueKind) -> &Arc<dyn JobQueue> {
        match kind {
            QueueKind::Sms => &self.sms_queue,
            QueueKind::Webhook => &self.webhook_queue,
        }
    }

    /// Enqueues every routed job. All enqueues are attempted even if one fails;
    /// any failure fails the whole event so the broker redelivers it.
    pub async fn handle_event(
        &self,
        event: NotificationEvent,
    ) -> Result<Vec<(QueueKind, EnqueueOutcome)>, Error> {
        let kinds = route(&event);
        let options = Self::job_options(&event);

        info!(
            event_id = %event.id,
            subscription_id = %event.subscription_id,
            event_type = %event.event_type,
            jobs = kinds.len(),
            "Notification event received"
        );

        let mut enqueued = Vec::with_capacity(kinds.len());
        let mut failures = Vec::new();

        for kind in kinds {
            match self
                .queue(kind)
                .enqueue(event.clone(), options.clone())
                .await
            {
                Ok(outcome) => enqueued.push((kind, outcome)),
                Err(e) => {
                    error!(
                        queue = %kind,
                        subscription_id = %event.subscription_id,
                        error = %e,
                        "Failed to enqueue notification job"
                    );
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(anyhow!(
                "Failed to enqueue {} job(s): {}",
                failures.len(),
                failures.join("; ")
            ));
        }

        Ok(enqueued)
    }
}

#[async_trait]
impl MessageHandler for NotificationService {
    async fn handle(&self, queue: &str, payload: Value) -> Result<(), HandlerError> {
        let event: NotificationEvent = serde_json::from_value(payload)?;
        let outcomes = self.handle_event(event).await?;

        debug!(queue = %queue, outcomes = ?outcomes, "Notification event handled");
        Ok(())
    }
}
