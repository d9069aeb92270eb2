//! Process-local job store.

use super::{JobStore, QueueDepths, Transition};
use crate::error::StoreResult;
use crate::job::{after, millis, JobId, JobRecord, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

type ReadyKey = (u8, u64, u64, JobId);
type DueKey = (u64, JobId);

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, JobRecord>,
    ready: BTreeSet<ReadyKey>,
    delayed: BTreeSet<DueKey>,
    in_flight: BTreeSet<DueKey>,
    dead: VecDeque<JobId>,
    next_seq: u64,
}

impl QueueState {
    fn ready_key(job: &JobRecord) -> ReadyKey {
        (job.priority, millis(job.scheduled_at), job.seq, job.id.clone())
    }

    fn make_ready(&mut self, id: &JobId, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.status = JobStatus::Pending;
            job.lock_token = None;
            job.lock_expires_at = None;
            job.updated_at = now;
            let key = Self::ready_key(job);
            self.ready.insert(key);
        }
    }

    /// Releases a claim if `token` still owns it.
    fn release(&mut self, id: &JobId, token: &str) -> Option<&mut JobRecord> {
        let job = self.jobs.get(id)?;
        if job.status != JobStatus::InFlight || job.lock_token.as_deref() != Some(token) {
            return None;
        }
        let expires = job.lock_expires_at.map(millis).unwrap_or(0);
        self.in_flight.remove(&(expires, id.clone()));
        self.jobs.get_mut(id)
    }
}

/// In-memory [`JobStore`].
///
/// A single mutex guards every queue, which makes each transition atomic.
/// State does not survive a restart.
#[derive(Default)]
pub struct MemoryJobStore {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn push(&self, mut job: JobRecord, now: DateTime<Utc>) -> StoreResult<JobStatus> {
        let mut queues = self.queues.lock();
        let state = queues.entry(job.queue.clone()).or_default();

        if let Some(existing) = state.jobs.get(&job.id) {
            return Ok(existing.status);
        }

        state.next_seq += 1;
        job.seq = state.next_seq;
        job.lock_token = None;
        job.lock_expires_at = None;
        job.updated_at = now;

        if job.scheduled_at <= now {
            job.status = JobStatus::Pending;
            state.ready.insert(QueueState::ready_key(&job));
        } else {
            job.status = JobStatus::Delayed;
            state.delayed.insert((millis(job.scheduled_at), job.id.clone()));
        }

        let status = job.status;
        state.jobs.insert(job.id.clone(), job);
        Ok(status)
    }

    async fn claim_next(
        &self,
        queue: &str,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JobRecord>> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        while let Some((_, _, _, id)) = state.ready.pop_first() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            let expires_at = after(now, lock_ttl);
            job.status = JobStatus::InFlight;
            job.lock_token = Some(Uuid::new_v4().to_string());
            job.lock_expires_at = Some(expires_at);
            job.updated_at = now;
            let claimed = job.clone();
            state.in_flight.insert((millis(expires_at), id));
            return Ok(Some(claimed));
        }

        Ok(None)
    }

    async fn complete(&self, queue: &str, id: &JobId, token: &str) -> StoreResult<Transition> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Transition::StaleLock);
        };

        if state.release(id, token).is_none() {
            return Ok(Transition::StaleLock);
        }
        state.jobs.remove(id);
        Ok(Transition::Applied)
    }

    async fn fail_and_reschedule(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        delay: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Transition::StaleLock);
        };

        let Some(job) = state.release(id, token) else {
            return Ok(Transition::StaleLock);
        };
        let due = after(now, delay);
        job.attempt = job.attempt.saturating_add(1);
        job.status = JobStatus::Delayed;
        job.scheduled_at = due;
        job.lock_token = None;
        job.lock_expires_at = None;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        state.delayed.insert((millis(due), id.clone()));
        Ok(Transition::Applied)
    }

    async fn dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Transition::StaleLock);
        };

        let Some(job) = state.release(id, token) else {
            return Ok(Transition::StaleLock);
        };
        job.attempt = job.attempt.saturating_add(1);
        job.status = JobStatus::DeadLettered;
        job.lock_token = None;
        job.lock_expires_at = None;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        state.dead.push_back(id.clone());
        Ok(Transition::Applied)
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>, limit: usize) -> StoreResult<u64> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let now_ms = millis(now);
        let mut moved = 0u64;
        while (moved as usize) < limit {
            match state.delayed.first() {
                Some((due, _)) if *due <= now_ms => {}
                _ => break,
            }
            if let Some((_, id)) = state.delayed.pop_first() {
                state.make_ready(&id, now);
                moved += 1;
            }
        }

        if moved > 0 {
            debug!(queue, count = moved, "Promoted delayed jobs");
        }
        Ok(moved)
    }

    async fn reclaim_expired_locks(&self, queue: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let now_ms = millis(now);
        let mut reclaimed = 0u64;
        while let Some((expires, _)) = state.in_flight.first() {
            if *expires > now_ms {
                break;
            }
            if let Some((_, id)) = state.in_flight.pop_first() {
                state.make_ready(&id, now);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn depths(&self, queue: &str) -> StoreResult<QueueDepths> {
        let queues = self.queues.lock();
        Ok(queues
            .get(queue)
            .map(|state| QueueDepths {
                ready: state.ready.len() as u64,
                delayed: state.delayed.len() as u64,
                in_flight: state.in_flight.len() as u64,
                dead_lettered: state.dead.len() as u64,
            })
            .unwrap_or_default())
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> StoreResult<Option<JobRecord>> {
        let queues = self.queues.lock();
        Ok(queues.get(queue).and_then(|state| state.jobs.get(id)).cloned())
    }

    async fn list_dead_letters(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        let queues = self.queues.lock();
        let Some(state) = queues.get(queue) else {
            return Ok(Vec::new());
        };

        Ok(state
            .dead
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn requeue_dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };

        let Some(pos) = state.dead.iter().position(|dead| dead == id) else {
            return Ok(false);
        };
        state.dead.remove(pos);

        state.next_seq += 1;
        let seq = state.next_seq;
        let Some(job) = state.jobs.get_mut(id) else {
            return Ok(false);
        };
        job.attempt = 0;
        job.max_attempts = max_attempts;
        job.scheduled_at = now;
        job.seq = seq;
        state.make_ready(id, now);
        Ok(true)
    }

    async fn purge_dead_letters(&self, queue: &str) -> StoreResult<u64> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let purged = state.dead.len() as u64;
        for id in std::mem::take(&mut state.dead) {
            state.jobs.remove(&id);
        }
        Ok(purged)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
