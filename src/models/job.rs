use std::fmt::{Display, Formatter, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::event::NotificationEvent;

/// Highest accepted priority value. Keeps `priority << 32 | seq` exact in an
/// f64 sorted-set score.
pub const MAX_PRIORITY: u32 = 1 << 21;

/// How long a reservation stays valid before the job is reclaimed. Longer than
/// any sender timeout.
pub const DEFAULT_LEASE_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Sms,
    Webhook,
}

impl QueueKind {
    pub fn queue_name(&self) -> &'static str {
        match self {
            QueueKind::Sms => "notification_sms",
            QueueKind::Webhook => "notification_webhook",
        }
    }
}

impl Display for QueueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.queue_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub id: String,
    pub priority: u32,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl EnqueueOptions {
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            priority: priority.min(MAX_PRIORITY),
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }
}

/// A reserved unit of work. `attempt` is 1 on the first delivery to a worker.
/// `lease` identifies this reservation; `complete` and `fail` are rejected once
/// the lease has expired and the job was handed out again.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub queue: QueueKind,
    pub priority: u32,
    pub payload: NotificationEvent,
    pub attempt: u32,
    pub lease: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    Replaced,
    /// The id is being processed; the submission runs after the current attempt.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay_ms: u64 },
    /// A submission parked while the job was active replaced the retry.
    Superseded,
    Failed,
}

/// A job that exhausted its attempts and was kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: String,
    pub payload: NotificationEvent,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub failed: u64,
}

/// Per-queue retry policy applied by the queue when a worker reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl JobRetryPolicy {
    /// Exponential: `backoff_ms * 2^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(20);
        self.backoff_ms.saturating_mul(1u64 << exponent)
    }
}

impl Default for JobRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1000,
        }
    }
}
