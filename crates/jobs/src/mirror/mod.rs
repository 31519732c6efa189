//! Best-effort persistence mirror.
//!
//! The manager projects job state to an external store after every
//! mutation so dashboards and audits can see it. The projection is
//! write-only: the manager never reads it back, and a failed write never
//! fails the operation that triggered it.

#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use dropqueue_core::{JobId, TenantId};

use crate::error::MirrorError;
use crate::types::{Job, JobStatus, Priority};

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobMirror;

/// Row written to the external store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorRecord {
    pub id: JobId,
    pub owner: Option<TenantId>,
    pub queue: String,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub progress: u8,
    pub total_items: u64,
    pub processed_items: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub errors: Vec<String>,
    pub metadata: serde_json::Value,
    pub attempt: u32,
    /// Later revisions supersede earlier ones, whatever order writes land in
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for MirrorRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            owner: job.owner,
            queue: job.queue.clone(),
            job_type: job.job_type.clone(),
            status: job.status,
            priority: job.priority,
            progress: job.progress,
            total_items: job.total_items,
            processed_items: job.processed_items,
            success_count: job.success_count,
            error_count: job.error_count,
            errors: job.errors.clone(),
            metadata: job.metadata.clone(),
            attempt: job.attempt,
            revision: job.revision,
            created_at: job.created_at,
            scheduled_at: job.scheduled_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// One-way projection of job state to a durable store.
pub trait JobMirror: Send + Sync {
    /// Write the current state of a job.
    ///
    /// Implementations may return before the write is durable, and writes
    /// may arrive out of order; a record must never replace one with a
    /// higher `revision`.
    fn record(&self, record: &MirrorRecord) -> Result<(), MirrorError>;
}

impl<M: JobMirror + ?Sized> JobMirror for Arc<M> {
    fn record(&self, record: &MirrorRecord) -> Result<(), MirrorError> {
        (**self).record(record)
    }
}

/// Mirror that discards every write.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopMirror;

impl JobMirror for NoopMirror {
    fn record(&self, _record: &MirrorRecord) -> Result<(), MirrorError> {
        Ok(())
    }
}

/// In-memory mirror for tests/dev.
///
/// Keeps the highest-revision record per job and the full write log. Can
/// be switched into a failing mode to exercise the best-effort contract.
#[derive(Debug, Default)]
pub struct InMemoryMirror {
    latest: RwLock<HashMap<JobId, MirrorRecord>>,
    log: RwLock<Vec<MirrorRecord>>,
    failing: AtomicBool,
}

impl InMemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn latest(&self, job_id: JobId) -> Option<MirrorRecord> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
    }

    /// Every record written for a job, in write order.
    pub fn records(&self, job_id: JobId) -> Vec<MirrorRecord> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.id == job_id)
            .cloned()
            .collect()
    }

    /// Statuses written for a job, in write order.
    pub fn status_history(&self, job_id: JobId) -> Vec<JobStatus> {
        self.records(job_id).iter().map(|r| r.status).collect()
    }

    pub fn write_count(&self) -> usize {
        self.log.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl JobMirror for InMemoryMirror {
    fn record(&self, record: &MirrorRecord) -> Result<(), MirrorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MirrorError::Storage("mirror unavailable".to_string()));
        }
        {
            let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
            let stale = latest
                .get(&record.id)
                .is_some_and(|current| current.revision >= record.revision);
            if !stale {
                latest.insert(record.id, record.clone());
            }
        }
        self.log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
