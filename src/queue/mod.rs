//! Priority job queues keyed by subject id.
//!
//! Both backends implement the same contract:
//!
//! - lower `priority` is reserved first, equal priorities in arrival order;
//! - enqueuing an id that is already pending replaces its payload and priority
//!   while keeping its arrival position;
//! - enqueuing an id that is currently reserved parks the submission until the
//!   active attempt completes or fails, at which point it becomes pending;
//! - a failed attempt is retried after the policy's backoff until the policy's
//!   attempt count is spent, then the job is removed or kept as failed.

pub mod memory;
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    event::NotificationEvent,
    job::{EnqueueOptions, EnqueueOutcome, FailOutcome, FailedJob, Job, QueueCounts, QueueKind},
};

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    async fn enqueue(
        &self,
        payload: NotificationEvent,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome>;

    /// Takes the next runnable job, if any, and marks it active.
    async fn reserve(&self) -> Result<Option<Job>>;

    async fn complete(&self, job: &Job) -> Result<()>;

    async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome>;

    async fn counts(&self) -> Result<QueueCounts>;

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>>;
}
