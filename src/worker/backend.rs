//! Job records and the backend that stores them.
//!
//! The queue only carries `{"job_id": ...}`. The backend owns the job
//! record and decides, under its own lock, whether a popped id is actually
//! ready to run for a given worker.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::PriorityLevel;
use crate::utils::error::{QueueError, QueueResult};

/// Queue payload pointing at a backend record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub handler: String,
    pub priority: PriorityLevel,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(handler: impl Into<String>, priority: PriorityLevel, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            handler: handler.into(),
            priority,
            run_at,
            attempts: 0,
            locked_by: None,
            locked_at: None,
            failed_at: None,
            last_error: None,
        }
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef {
            job_id: self.id.clone(),
        }
    }

    /// Due, not permanently failed, and either unlocked, locked by a worker
    /// that has exceeded `max_run_time`, or already locked by `worker`.
    pub fn is_ready_for(&self, worker: &str, max_run_time: Duration, now: DateTime<Utc>) -> bool {
        if self.failed_at.is_some() {
            return false;
        }
        if self.locked_by.as_deref() == Some(worker) {
            return true;
        }
        let stale_before = chrono::Duration::from_std(max_run_time)
            .ok()
            .and_then(|run_time| now.checked_sub_signed(run_time))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.run_at <= now && self.locked_at.is_none_or(|at| at < stale_before)
    }
}

pub trait JobBackend: Send + Sync {
    /// Lock the job for `worker` if it is ready to run. `None` means the
    /// job is missing or not runnable right now.
    fn reserve(&self, job_id: &str, worker: &str, max_run_time: Duration) -> QueueResult<Option<Job>>;

    /// The job succeeded; forget it.
    fn complete(&self, job_id: &str) -> QueueResult<()>;

    /// Record a failed attempt and unlock the job. With `retry_at` the job
    /// becomes runnable again at that time, otherwise it is marked failed
    /// for good. Returns the updated record.
    fn fail(&self, job_id: &str, error: &str, retry_at: Option<DateTime<Utc>>) -> QueueResult<Job>;

    /// Unlock every job held by `worker`. Returns how many were unlocked.
    fn clear_locks(&self, worker: &str) -> QueueResult<usize>;
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    jobs: Mutex<HashMap<String, Job>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, handler: impl Into<String>, priority: PriorityLevel, run_at: DateTime<Utc>) -> Job {
        let job = Job::new(handler, priority, run_at);
        self.insert(job.clone());
        job
    }

    pub fn insert(&self, job: Job) {
        self.lock().insert(job.id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock().get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl JobBackend for InMemoryBackend {
    fn reserve(&self, job_id: &str, worker: &str, max_run_time: Duration) -> QueueResult<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if !job.is_ready_for(worker, max_run_time, now) {
            return Ok(None);
        }
        job.locked_by = Some(worker.to_string());
        job.locked_at = Some(now);
        Ok(Some(job.clone()))
    }

    fn complete(&self, job_id: &str) -> QueueResult<()> {
        self.lock().remove(job_id);
        Ok(())
    }

    fn fail(&self, job_id: &str, error: &str, retry_at: Option<DateTime<Utc>>) -> QueueResult<Job> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::InvalidArgument(format!("unknown job '{job_id}'")))?;

        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.locked_by = None;
        job.locked_at = None;
        match retry_at {
            Some(at) => job.run_at = at,
            None => job.failed_at = Some(Utc::now()),
        }
        Ok(job.clone())
    }

    fn clear_locks(&self, worker: &str) -> QueueResult<usize> {
        let mut cleared = 0;
        for job in self.lock().values_mut() {
            if job.locked_by.as_deref() == Some(worker) {
                job.locked_by = None;
                job.locked_at = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}
