use std::{
    collections::{BTreeSet, HashMap},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    models::{
        event::NotificationEvent,
        job::{
            DEFAULT_LEASE_MS, EnqueueOptions, EnqueueOutcome, FailOutcome, FailedJob, Job,
            JobRetryPolicy, QueueCounts, QueueKind,
        },
    },
    queue::JobQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Waiting,
    Delayed(Instant),
    Active { lease: u64, expires_at: Instant },
}

impl Location {
    fn is_active(&self) -> bool {
        matches!(self, Location::Active { .. })
    }
}

#[derive(Debug)]
struct StoredJob {
    payload: NotificationEvent,
    options: EnqueueOptions,
    seq: u64,
    attempts: u32,
    location: Location,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    next_lease: u64,
    jobs: HashMap<String, StoredJob>,
    waiting: BTreeSet<(u32, u64, String)>,
    delayed: BTreeSet<(Instant, String)>,
    parked: HashMap<String, (NotificationEvent, EnqueueOptions)>,
    completed: HashMap<String, NotificationEvent>,
    failed: HashMap<String, FailedJob>,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn insert_new(&mut self, payload: NotificationEvent, options: EnqueueOptions) {
        let seq = self.next_seq();
        self.waiting.insert((options.priority, seq, options.id.clone()));
        self.jobs.insert(
            options.id.clone(),
            StoredJob {
                payload,
                options,
                seq,
                attempts: 0,
                location: Location::Waiting,
            },
        );
    }

    fn promote_parked(&mut self, id: &str) -> bool {
        match self.parked.remove(id) {
            Some((payload, options)) => {
                self.insert_new(payload, options);
                true
            }
            None => false,
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some((ready_at, _)) = self.delayed.first() {
            if *ready_at > now {
                break;
            }
            let Some((_, id)) = self.delayed.pop_first() else {
                break;
            };
            let seq = self.next_seq();
            if let Some(job) = self.jobs.get_mut(&id) {
                job.seq = seq;
                job.location = Location::Waiting;
                self.waiting.insert((job.options.priority, seq, id));
            }
        }
    }

    fn take_active(&mut self, id: &str, lease: u64) -> Result<StoredJob> {
        match self.jobs.get(id).map(|job| job.location) {
            Some(Location::Active { lease: current, .. }) if current == lease => {}
            Some(Location::Active { .. }) => {
                return Err(anyhow!("Lease {} on job {} was lost", lease, id));
            }
            _ => return Err(anyhow!("Job {} is not active", id)),
        }
        self.jobs
            .remove(id)
            .ok_or_else(|| anyhow!("Job {} is not active", id))
    }

    fn record_failure(&mut self, id: &str, stored: StoredJob, error: &str) {
        if !stored.options.remove_on_fail {
            self.failed.insert(
                id.to_string(),
                FailedJob {
                    id: id.to_string(),
                    payload: stored.payload,
                    attempts: stored.attempts,
                    error: error.to_string(),
                    failed_at: Utc::now(),
                },
            );
        }
    }

    /// Hands expired reservations back. The lost attempt counts against the
    /// policy; a parked submission takes over as for a failure.
    fn reclaim_expired(&mut self, now: Instant, policy: &JobRetryPolicy) -> Vec<String> {
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter_map(|(id, job)| match job.location {
                Location::Active { expires_at, .. } if expires_at <= now => Some(id.clone()),
                _ => None,
            })
            .collect();

        for id in &expired {
            let Some(mut stored) = self.jobs.remove(id) else {
                continue;
            };
            if self.promote_parked(id) {
                continue;
            }
            if stored.attempts < policy.attempts {
                let seq = self.next_seq();
                stored.seq = seq;
                stored.location = Location::Waiting;
                self.waiting.insert((stored.options.priority, seq, id.clone()));
                self.jobs.insert(id.clone(), stored);
            } else {
                self.record_failure(id, stored, "lease expired");
            }
        }

        expired
    }
}

/// In-process queue with the same semantics as the Redis backend. State is
/// lost on restart.
pub struct MemoryJobQueue {
    kind: QueueKind,
    policy: JobRetryPolicy,
    lease: Duration,
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    pub fn new(kind: QueueKind, policy: JobRetryPolicy) -> Self {
        Self {
            kind,
            policy,
            lease: Duration::from_millis(DEFAULT_LEASE_MS),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("Queue {} state is poisoned", self.kind))
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn enqueue(
        &self,
        payload: NotificationEvent,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let mut state = self.lock()?;
        let id = options.id.clone();

        let existing = state.jobs.get(&id).map(|job| (job.location, job.seq, job.options.priority));

        let outcome = match existing {
            Some((Location::Active { .. }, _, _)) => {
                state.parked.insert(id.clone(), (payload, options));
                EnqueueOutcome::Deferred
            }
            Some((location, seq, old_priority)) => {
                match location {
                    Location::Waiting => {
                        state.waiting.remove(&(old_priority, seq, id.clone()));
                    }
                    Location::Delayed(ready_at) => {
                        state.delayed.remove(&(ready_at, id.clone()));
                    }
                    Location::Active { .. } => {}
                }
                state.waiting.insert((options.priority, seq, id.clone()));
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.payload = payload;
                    job.options = options;
                    job.attempts = 0;
                    job.location = Location::Waiting;
                }
                EnqueueOutcome::Replaced
            }
            None => {
                state.insert_new(payload, options);
                EnqueueOutcome::Added
            }
        };

        debug!(queue = %self.kind, job_id = %id, outcome = ?outcome, "Job enqueued");
        Ok(outcome)
    }

    async fn reserve(&self) -> Result<Option<Job>> {
        let mut state = self.lock()?;
        let now = Instant::now();

        for id in state.reclaim_expired(now, &self.policy) {
            warn!(queue = %self.kind, job_id = %id, "Reclaimed job with an expired lease");
        }
        state.promote_due(now);

        let Some((priority, _, id)) = state.waiting.pop_first() else {
            return Ok(None);
        };

        state.next_lease += 1;
        let lease = state.next_lease;
        let expires_at = now + self.lease;

        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Job {} is waiting without data", id))?;
        job.location = Location::Active { lease, expires_at };
        job.attempts += 1;

        Ok(Some(Job {
            id,
            queue: self.kind,
            priority,
            payload: job.payload.clone(),
            attempt: job.attempts,
            lease,
        }))
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        let mut state = self.lock()?;
        let stored = state.take_active(&job.id, job.lease)?;

        if !stored.options.remove_on_complete {
            state.completed.insert(job.id.clone(), stored.payload);
        }
        state.promote_parked(&job.id);

        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome> {
        let mut state = self.lock()?;
        let mut stored = state.take_active(&job.id, job.lease)?;

        if state.promote_parked(&job.id) {
            return Ok(FailOutcome::Superseded);
        }

        if stored.attempts < self.policy.attempts {
            let delay_ms = self.policy.delay_for(stored.attempts);
            let ready_at = Instant::now() + Duration::from_millis(delay_ms);
            stored.location = Location::Delayed(ready_at);
            state.delayed.insert((ready_at, job.id.clone()));
            state.jobs.insert(job.id.clone(), stored);
            return Ok(FailOutcome::Retrying { delay_ms });
        }

        state.record_failure(&job.id, stored, error);

        Ok(FailOutcome::Failed)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.lock()?;
        let active = state
            .jobs
            .values()
            .filter(|job| job.location.is_active())
            .count();

        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            delayed: state.delayed.len() as u64,
            active: active as u64,
            failed: state.failed.len() as u64,
        })
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>> {
        let state = self.lock()?;
        let mut failed: Vec<FailedJob> = state.failed.values().cloned().collect();
        failed.sort_by_key(|job| job.failed_at);
        Ok(failed)
    }
}
