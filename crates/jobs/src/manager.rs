//! Job queue manager: submission, lifecycle tracking and dispatch.
//!
//! The manager owns every queue and job. Callers get snapshots and invoke
//! the mutating operations below; nothing else mutates job state. All
//! state lives behind one lock, and mirror writes and job execution happen
//! after the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, error, info, warn};

use dropqueue_core::{Clock, JobId, SystemClock, TenantId};

use crate::config::{ManagerConfig, PromotionPolicy};
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::error::QueueError;
use crate::executor::{self, HandlerRegistry};
use crate::mirror::{JobMirror, MirrorRecord, NoopMirror};
use crate::queue::{Queue, QueueConfig, QueueStats};
use crate::types::{Job, JobSpec, JobStatus, ProgressUpdate, RetryPolicy};

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs promoted to running, in promotion order
    pub promoted: Vec<JobId>,
    /// Terminal jobs dropped after their retention window
    pub evicted: usize,
}

#[derive(Debug, Default)]
struct State {
    queues: BTreeMap<String, Queue>,
    /// Job id -> owning queue name
    index: HashMap<JobId, String>,
    next_sequence: u64,
}

struct Inner {
    state: RwLock<State>,
    config: ManagerConfig,
    mirror: Arc<dyn JobMirror>,
    clock: Arc<dyn Clock>,
    handlers: Option<HandlerRegistry>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
}

impl Inner {
    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns named queues and drives their dispatch.
///
/// Cheap to clone; clones share the same queues. Construct one per
/// process (or per test) with [`JobQueueManager::builder`].
#[derive(Clone)]
pub struct JobQueueManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read_state();
        f.debug_struct("JobQueueManager")
            .field("queues", &state.queues.keys().collect::<Vec<_>>())
            .field("jobs", &state.index.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Builder for [`JobQueueManager`].
pub struct JobQueueManagerBuilder {
    config: ManagerConfig,
    mirror: Arc<dyn JobMirror>,
    clock: Arc<dyn Clock>,
    handlers: Option<HandlerRegistry>,
}

impl JobQueueManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a queue on top of those in the config.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queues.push(queue);
        self
    }

    pub fn mirror(mut self, mirror: impl JobMirror + 'static) -> Self {
        self.mirror = Arc::new(mirror);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Execute promoted jobs with these handlers.
    ///
    /// Without handlers, promoted jobs stay running until an external
    /// collaborator calls [`JobQueueManager::complete_job`] or
    /// [`JobQueueManager::fail_attempt`].
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn build(self) -> Result<JobQueueManager, QueueError> {
        let mut state = State::default();
        for queue in &self.config.queues {
            queue.validate()?;
            if state.queues.contains_key(&queue.name) {
                return Err(QueueError::QueueExists(queue.name.clone()));
            }
            state
                .queues
                .insert(queue.name.clone(), Queue::from_config(queue));
        }

        Ok(JobQueueManager {
            inner: Arc::new(Inner {
                state: RwLock::new(state),
                config: self.config,
                mirror: self.mirror,
                clock: self.clock,
                handlers: self.handlers,
                dispatcher: Mutex::new(None),
            }),
        })
    }
}

impl JobQueueManager {
    pub fn builder() -> JobQueueManagerBuilder {
        JobQueueManagerBuilder {
            config: ManagerConfig::default(),
            mirror: Arc::new(NoopMirror),
            clock: Arc::new(SystemClock),
            handlers: None,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Register a new queue.
    pub fn create_queue(&self, config: QueueConfig) -> Result<(), QueueError> {
        config.validate()?;
        let mut state = self.inner.write_state();
        if state.queues.contains_key(&config.name) {
            return Err(QueueError::QueueExists(config.name));
        }
        info!(
            queue = %config.name,
            concurrency = config.concurrency,
            retry_attempts = config.retry_attempts,
            "queue created"
        );
        state
            .queues
            .insert(config.name.clone(), Queue::from_config(&config));
        Ok(())
    }

    /// Submit a job; returns immediately with its id.
    pub fn submit(&self, queue: &str, spec: JobSpec) -> Result<JobId, QueueError> {
        spec.validate()?;
        let now = self.inner.clock.now();

        let job = {
            let mut state = self.inner.write_state();
            if !state.queues.contains_key(queue) {
                return Err(QueueError::QueueNotFound(queue.to_string()));
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let job = Job::new(queue, spec, now, sequence);
            state.index.insert(job.id, queue.to_string());
            if let Some(q) = state.queues.get_mut(queue) {
                q.jobs.insert(job.id, job.clone());
            }
            job
        };

        info!(
            job_id = %job.id,
            queue,
            job_type = %job.job_type,
            priority = %job.priority,
            scheduled_at = %job.scheduled_at,
            "job submitted"
        );
        self.mirror(&job);
        if self.inner.config.auto_start {
            self.ensure_dispatching();
        }
        Ok(job.id)
    }

    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        let state = self.inner.read_state();
        let queue = state.index.get(&job_id)?;
        state.queues.get(queue)?.jobs.get(&job_id).cloned()
    }

    /// Snapshot of a queue's jobs, in no particular order.
    pub fn list_queue_jobs(&self, queue: &str) -> Result<Vec<Job>, QueueError> {
        let state = self.inner.read_state();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        Ok(q.jobs.values().cloned().collect())
    }

    /// Jobs submitted by a tenant across all queues, oldest first.
    pub fn list_owner_jobs(&self, owner: TenantId) -> Vec<Job> {
        let state = self.inner.read_state();
        let mut jobs: Vec<Job> = state
            .queues
            .values()
            .flat_map(|q| q.jobs.values())
            .filter(|j| j.owner == Some(owner))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.sequence));
        jobs
    }

    pub fn update_progress(&self, job_id: JobId, update: ProgressUpdate) -> Result<Job, QueueError> {
        self.progress_for(job_id, None, update)
    }

    /// [`update_progress`](Self::update_progress) fenced to one execution attempt.
    pub(crate) fn update_attempt_progress(
        &self,
        job_id: JobId,
        attempt: u32,
        update: ProgressUpdate,
    ) -> Result<Job, QueueError> {
        self.progress_for(job_id, Some(attempt), update)
    }

    fn progress_for(
        &self,
        job_id: JobId,
        attempt: Option<u32>,
        update: ProgressUpdate,
    ) -> Result<Job, QueueError> {
        let job = self.mutate_job(job_id, attempt, |job, _| job.apply_progress(update))?;
        debug!(
            %job_id,
            progress = job.progress,
            processed = job.processed_items,
            total = job.total_items,
            "job progress updated"
        );
        self.mirror(&job);
        Ok(job)
    }

    /// Finish a running job as completed (`success`) or failed.
    pub fn complete_job(&self, job_id: JobId, success: bool) -> Result<Job, QueueError> {
        self.finish_for(job_id, None, success)
    }

    /// [`complete_job`](Self::complete_job) fenced to one execution attempt.
    pub(crate) fn complete_attempt(
        &self,
        job_id: JobId,
        attempt: u32,
        success: bool,
    ) -> Result<Job, QueueError> {
        self.finish_for(job_id, Some(attempt), success)
    }

    fn finish_for(&self, job_id: JobId, attempt: Option<u32>, success: bool) -> Result<Job, QueueError> {
        let now = self.inner.clock.now();
        let retention = self.inner.config.retention();
        let job = self.mutate_job(job_id, attempt, |job, _| {
            job.mark_finished(success, now, retention)
        })?;

        info!(
            %job_id,
            queue = %job.queue,
            status = %job.status,
            processed = job.processed_items,
            errors = job.error_count,
            "job finished"
        );
        self.mirror(&job);
        Ok(job)
    }

    /// Record an execution error for a running job.
    ///
    /// Requeues with the queue's backoff while retries remain, otherwise
    /// fails the job.
    pub fn fail_attempt(&self, job_id: JobId, error: impl Into<String>) -> Result<Job, QueueError> {
        self.failure_for(job_id, None, error.into())
    }

    /// [`fail_attempt`](Self::fail_attempt) fenced to one execution attempt.
    pub(crate) fn fail_running_attempt(
        &self,
        job_id: JobId,
        attempt: u32,
        error: impl Into<String>,
    ) -> Result<Job, QueueError> {
        self.failure_for(job_id, Some(attempt), error.into())
    }

    fn failure_for(&self, job_id: JobId, attempt: Option<u32>, error: String) -> Result<Job, QueueError> {
        let now = self.inner.clock.now();
        let retention = self.inner.config.retention();
        let job = self.mutate_job(job_id, attempt, |job, retry| {
            job.mark_attempt_failed(error.clone(), retry, now, retention)
        })?;

        if job.status == JobStatus::Queued {
            warn!(
                %job_id,
                queue = %job.queue,
                attempt = job.attempt,
                retry_at = %job.scheduled_at,
                %error,
                "job attempt failed; retry scheduled"
            );
        } else {
            warn!(
                %job_id,
                queue = %job.queue,
                attempt = job.attempt,
                %error,
                "job failed; retries exhausted"
            );
        }
        self.mirror(&job);
        Ok(job)
    }

    /// Cancel a job that has not started yet.
    pub fn cancel_job(&self, job_id: JobId) -> Result<Job, QueueError> {
        let now = self.inner.clock.now();
        let retention = self.inner.config.retention();
        let job = self.mutate_job(job_id, None, |job, _| job.mark_cancelled(now, retention))?;

        info!(%job_id, queue = %job.queue, "job cancelled");
        self.mirror(&job);
        Ok(job)
    }

    /// Stop admitting jobs from a queue; its jobs stay queued.
    pub fn pause_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.set_active(queue, false)
    }

    pub fn resume_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.set_active(queue, true)
    }

    pub fn queue_stats(&self) -> BTreeMap<String, QueueStats> {
        let state = self.inner.read_state();
        state
            .queues
            .iter()
            .map(|(name, q)| (name.clone(), q.stats()))
            .collect()
    }

    /// One dispatch pass over every queue.
    ///
    /// Evicts expired terminal jobs, then for each active queue with a free
    /// slot promotes the best eligible job (or several, under
    /// [`PromotionPolicy::FillAvailable`]).
    pub fn tick(&self) -> TickReport {
        let now = self.inner.clock.now();
        let promotion = self.inner.config.promotion;
        let mut promoted = Vec::new();
        let mut evicted = 0;

        {
            let mut state = self.inner.write_state();
            let State { queues, index, .. } = &mut *state;

            for queue in queues.values_mut() {
                let expired = queue.evict_expired(now);
                if !expired.is_empty() {
                    debug!(queue = %queue.name, count = expired.len(), "evicted expired terminal jobs");
                }
                for id in expired {
                    index.remove(&id);
                    evicted += 1;
                }

                if !queue.is_active {
                    continue;
                }

                let slots = match promotion {
                    PromotionPolicy::OnePerTick => queue.available_slots().min(1),
                    PromotionPolicy::FillAvailable => queue.available_slots(),
                };

                for _ in 0..slots {
                    let Some(id) = queue.next_candidate(now) else {
                        break;
                    };
                    if let Some(job) = queue.jobs.get_mut(&id) {
                        job.mark_running(now);
                        promoted.push(job.clone());
                    }
                }
            }
        }

        let mut report = TickReport {
            promoted: Vec::with_capacity(promoted.len()),
            evicted,
        };
        for job in promoted {
            debug!(
                job_id = %job.id,
                queue = %job.queue,
                priority = %job.priority,
                attempt = job.attempt,
                "job promoted to running"
            );
            self.mirror(&job);
            report.promoted.push(job.id);
            self.execute(job);
        }
        report
    }

    /// Spawn the background dispatch loop if it is not running.
    pub fn start(&self) -> std::io::Result<()> {
        let mut slot = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = Dispatcher::spawn(
            "dropqueue-dispatcher",
            self.inner.config.tick_interval(),
            move || match weak.upgrade() {
                Some(inner) => {
                    JobQueueManager { inner }.tick();
                    true
                }
                None => false,
            },
        )?;
        *slot = Some(handle);
        Ok(())
    }

    pub fn is_dispatching(&self) -> bool {
        self.inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the dispatch loop and wait for it. Running jobs are not interrupted.
    pub fn shutdown(&self) {
        let handle = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
    }

    fn ensure_dispatching(&self) {
        if let Err(err) = self.start() {
            error!(error = %err, "failed to start dispatcher");
        }
    }

    fn set_active(&self, queue: &str, active: bool) -> Result<(), QueueError> {
        let mut state = self.inner.write_state();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        q.is_active = active;
        info!(queue, active, "queue state changed");
        Ok(())
    }

    /// Apply `f` to a job under the write lock and return the new snapshot.
    ///
    /// With `attempt`, a running job whose current attempt differs is left
    /// untouched.
    fn mutate_job<F>(&self, job_id: JobId, attempt: Option<u32>, f: F) -> Result<Job, QueueError>
    where
        F: FnOnce(&mut Job, &RetryPolicy) -> Result<(), QueueError>,
    {
        let mut state = self.inner.write_state();
        let State { queues, index, .. } = &mut *state;

        let queue = index
            .get(&job_id)
            .and_then(|name| queues.get_mut(name))
            .ok_or(QueueError::JobNotFound(job_id))?;
        let job = queue
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        if let Some(attempt) = attempt {
            job.ensure_attempt(attempt)?;
        }
        f(job, &queue.retry)?;
        Ok(job.clone())
    }

    fn mirror(&self, job: &Job) {
        if let Err(err) = self.inner.mirror.record(&MirrorRecord::from(job)) {
            warn!(job_id = %job.id, status = %job.status, error = %err, "mirror write failed");
        }
    }

    fn execute(&self, job: Job) {
        if let Some(handlers) = &self.inner.handlers {
            let handler = handlers.resolve(&job.job_type);
            executor::spawn_execution(self.clone(), handler, job);
        }
    }
}
