//! Job execution: handler registry and per-job worker threads.
//!
//! The queue only decides *when* work starts. What a job does is supplied
//! by the application through handlers registered per job type.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info_span, warn};

use dropqueue_core::JobId;

use crate::error::{ExecutionError, QueueError};
use crate::manager::JobQueueManager;
use crate::types::{Job, ProgressUpdate};

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn(&JobContext) -> anyhow::Result<()> + Send + Sync>;

/// Handlers keyed by job type pattern.
///
/// Lookup order: exact type, then the longest matching category pattern
/// (`"ai.*"` matches `"ai.enrich"`), then the wildcard `"*"`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type pattern.
    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JobContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(pattern, handler);
        self
    }

    pub fn resolve(&self, job_type: &str) -> Option<JobHandler> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h.clone());
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler.clone());
        if category.is_some() {
            return category;
        }

        self.handlers.get("*").cloned()
    }
}

/// What a handler sees while running a job.
pub struct JobContext {
    manager: JobQueueManager,
    job: Job,
}

impl JobContext {
    /// Snapshot of the job taken when it was promoted.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn metadata(&self) -> &serde_json::Value {
        &self.job.metadata
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    /// Report progress through the manager (validated and mirrored).
    ///
    /// Rejected with `InvalidTransition` once this attempt has been
    /// superseded by a retry.
    pub fn report_progress(&self, update: ProgressUpdate) -> Result<Job, QueueError> {
        self.manager
            .update_attempt_progress(self.job.id, self.job.attempt, update)
    }
}

/// Run a promoted job on its own thread.
pub(crate) fn spawn_execution(manager: JobQueueManager, handler: Option<JobHandler>, job: Job) {
    let job_id = job.id;
    let attempt = job.attempt;
    let fallback = manager.clone();

    let spawned = thread::Builder::new()
        .name(format!("dropqueue-job-{job_id}"))
        .spawn(move || run_job(manager, handler, job));

    if let Err(err) = spawned {
        error!(%job_id, error = %err, "failed to spawn job thread");
        if let Err(e) = fallback.fail_running_attempt(
            job_id,
            attempt,
            format!("failed to spawn job thread: {err}"),
        ) {
            warn!(%job_id, error = %e, "failed to record job failure");
        }
    }
}

fn run_job(manager: JobQueueManager, handler: Option<JobHandler>, job: Job) {
    let span = info_span!(
        "job",
        job.id = %job.id,
        job.queue = %job.queue,
        job.type = %job.job_type,
        job.attempt = job.attempt
    );
    let _enter = span.enter();
    let job_id = job.id;
    let attempt = job.attempt;

    let result = match handler {
        Some(handler) => {
            let ctx = JobContext {
                manager: manager.clone(),
                job,
            };
            panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx)))
                .map_err(|payload| ExecutionError::from_panic(payload.as_ref()))
                .and_then(|r| r.map_err(ExecutionError::from))
        }
        None => Err(ExecutionError::new(format!(
            "no handler for job type: {}",
            job.job_type
        ))),
    };

    match result {
        Ok(()) => match manager.complete_attempt(job_id, attempt, true) {
            Ok(_) => debug!("job completed successfully"),
            // Finished by the handler itself, or retried after an external failure.
            Err(QueueError::InvalidTransition { from, .. }) => {
                debug!(status = %from, "job already finalized or superseded")
            }
            Err(err) => warn!(error = %err, "failed to record job completion"),
        },
        Err(err) => {
            warn!(error = %err, "job execution failed");
            match manager.fail_running_attempt(job_id, attempt, err.message) {
                Ok(_) => {}
                Err(QueueError::InvalidTransition { from, .. }) => {
                    debug!(status = %from, "failure not recorded; job already finalized or superseded")
                }
                Err(e) => warn!(error = %e, "failed to record job failure"),
            }
        }
    }
}
