//! Worker loop
//!
//! A `Worker` pops job references from a `QueueManager`, reserves the job in
//! its `JobBackend` and runs it. Every popped item is acknowledged once the
//! attempt is over, whatever the outcome:
//! - success: the job is completed
//! - failure with attempts left: the job is rescheduled and published again
//!   for its new run time (so it goes through the deferred path)
//! - failure with no attempts left: the job is marked failed
//! - the backend refuses the reservation (missing, locked, failed, not yet
//!   due): the item is skipped

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::queue::{QueueManager, WorkItem};
use crate::utils::error::QueueResult;
use crate::utils::throughput::Throughput;
use crate::worker::backend::{Job, JobBackend, JobRef};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(4 * 60 * 60);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Default backoff: `attempts^4 + 5` seconds.
pub fn default_retry_delay(attempts: u32) -> Duration {
    Duration::from_secs(u64::from(attempts).pow(4) + 5)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Retrying { attempts: u32, retry_at: DateTime<Utc> },
    Failed { attempts: u32 },
    Skipped,
}

/// Counts returned by `Worker::work_off`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkOffSummary {
    pub success: usize,
    pub failure: usize,
    pub skipped: usize,
}

type RetryDelay = Box<dyn Fn(u32) -> Duration + Send + Sync>;

pub struct Worker<B: JobBackend> {
    name: String,
    queue: Arc<QueueManager>,
    backend: Arc<B>,
    max_attempts: u32,
    max_run_time: Duration,
    retry_delay: RetryDelay,
    throughput: Throughput,
}

impl<B: JobBackend> Worker<B> {
    pub fn new(name: impl Into<String>, queue: Arc<QueueManager>, backend: Arc<B>) -> Self {
        let name = name.into();
        Self {
            throughput: Throughput::new(name.clone(), REPORT_INTERVAL),
            name,
            queue,
            backend,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_run_time: DEFAULT_MAX_RUN_TIME,
            retry_delay: Box::new(default_retry_delay),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    pub fn with_retry_delay(mut self, delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.retry_delay = Box::new(delay);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn throughput(&self) -> &Throughput {
        &self.throughput
    }

    /// Publish a reference to `job` for its run time and priority.
    pub fn enqueue(&self, job: &Job) -> QueueResult<()> {
        self.queue.publish(&job.job_ref(), job.priority, job.run_at)
    }

    /// Pop one item, blocking until work is available, and process it.
    pub fn work_one<F>(&mut self, perform: F) -> QueueResult<Outcome>
    where
        F: FnOnce(&Job) -> Result<(), String>,
    {
        let item = self.queue.pop()?;
        self.process(item, perform)
    }

    /// Process one item if any is ready.
    pub fn try_work_one<F>(&mut self, perform: F) -> QueueResult<Option<Outcome>>
    where
        F: FnOnce(&Job) -> Result<(), String>,
    {
        match self.queue.try_pop()? {
            Some(item) => self.process(item, perform).map(Some),
            None => Ok(None),
        }
    }

    /// Process up to `limit` ready items without blocking.
    pub fn work_off<F>(&mut self, limit: usize, mut perform: F) -> QueueResult<WorkOffSummary>
    where
        F: FnMut(&Job) -> Result<(), String>,
    {
        let mut summary = WorkOffSummary::default();
        for _ in 0..limit {
            match self.try_work_one(&mut perform)? {
                Some(Outcome::Completed) => summary.success += 1,
                Some(Outcome::Retrying { .. } | Outcome::Failed { .. }) => summary.failure += 1,
                Some(Outcome::Skipped) => summary.skipped += 1,
                None => break,
            }
        }
        Ok(summary)
    }

    /// Release every job this worker still has locked.
    pub fn clear_locks(&self) -> QueueResult<usize> {
        let cleared = self.backend.clear_locks(&self.name)?;
        if cleared > 0 {
            info!(worker = %self.name, cleared, "cleared job locks");
        }
        Ok(cleared)
    }

    fn process<F>(&mut self, item: WorkItem, perform: F) -> QueueResult<Outcome>
    where
        F: FnOnce(&Job) -> Result<(), String>,
    {
        let outcome = match self.attempt(&item, perform) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Settle the item so it does not pin the consumer's prefetch slot.
                if let Err(release) = self.queue.release(&item) {
                    warn!(worker = %self.name, error = %release, "could not release work after failure");
                }
                return Err(e);
            }
        };
        self.queue.ack(&item)?;
        self.throughput.report_if_due();
        Ok(outcome)
    }

    fn attempt<F>(&mut self, item: &WorkItem, perform: F) -> QueueResult<Outcome>
    where
        F: FnOnce(&Job) -> Result<(), String>,
    {
        let job_ref: JobRef = match item.payload_as() {
            Ok(job_ref) => job_ref,
            Err(e) => {
                warn!(worker = %self.name, error = %e, "popped item is not a job reference, skipping");
                return Ok(Outcome::Skipped);
            }
        };

        let Some(job) = self
            .backend
            .reserve(&job_ref.job_id, &self.name, self.max_run_time)?
        else {
            debug!(worker = %self.name, job_id = %job_ref.job_id, "job not runnable, skipping");
            return Ok(Outcome::Skipped);
        };

        match self.throughput.record(|| perform(&job)) {
            Ok(()) => {
                self.backend.complete(&job.id)?;
                debug!(worker = %self.name, job_id = %job.id, "job completed");
                Ok(Outcome::Completed)
            }
            Err(error) => {
                let attempts = job.attempts + 1;
                if attempts < self.max_attempts {
                    let retry_at = chrono::Duration::from_std((self.retry_delay)(attempts))
                        .ok()
                        .and_then(|delay| Utc::now().checked_add_signed(delay))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    let updated = self.backend.fail(&job.id, &error, Some(retry_at))?;
                    self.enqueue(&updated)?;
                    warn!(worker = %self.name, job_id = %job.id, attempts, %retry_at, error = %error, "job failed, retrying");
                    Ok(Outcome::Retrying { attempts, retry_at })
                } else {
                    self.backend.fail(&job.id, &error, None)?;
                    warn!(worker = %self.name, job_id = %job.id, attempts, error = %error, "job failed permanently");
                    Ok(Outcome::Failed { attempts })
                }
            }
        }
    }
}
