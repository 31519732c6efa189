//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dropqueue_core::{DomainError, DomainResult, JobId, TenantId};

use crate::error::QueueError;

/// Dispatch priority. Higher variants are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
///
/// `Queued -> Running -> {Completed | Failed}` and `Queued -> Cancelled`.
/// A failed attempt with retries left moves `Running -> Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for admission
    Queued,
    /// Admitted by the dispatcher, work in progress
    Running,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully (retries exhausted or reported failure)
    Failed,
    /// Withdrawn before it started
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Upper bound on a single retry delay, whatever the policy computes.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Per-queue retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (0 = fail on first error)
    pub max_retries: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay
            .min(self.max_delay.max(self.base_delay))
            .min(MAX_RETRY_DELAY)
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub job_type: String,
    pub priority: Priority,
    pub total_items: u64,
    /// Earliest dispatch time; `None` means "as soon as possible".
    pub scheduled_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub owner: Option<TenantId>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            priority: Priority::Normal,
            total_items: 0,
            scheduled_at: None,
            metadata: serde_json::Value::Null,
            owner: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn total_items(mut self, total_items: u64) -> Self {
        self.total_items = total_items;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn owner(mut self, owner: TenantId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub(crate) fn validate(&self) -> DomainResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job type must not be empty"));
        }
        Ok(())
    }
}

/// Progress report for a running job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Percentage; values above 100 are capped.
    pub progress: u8,
    pub processed_items: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Messages appended to the job's error list.
    pub errors: Vec<String>,
}

impl ProgressUpdate {
    pub fn new(progress: u8) -> Self {
        Self {
            progress,
            ..Default::default()
        }
    }

    pub fn items(mut self, processed: u64, success: u64, errors: u64) -> Self {
        self.processed_items = processed;
        self.success_count = success;
        self.error_count = errors;
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.errors.push(message.into());
        self
    }
}

/// A tracked unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Owning queue; fixed for the job's lifetime
    pub queue: String,
    pub owner: Option<TenantId>,
    /// Application-defined tag, opaque to the queue
    pub job_type: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub total_items: u64,
    pub processed_items: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub errors: Vec<String>,
    pub metadata: serde_json::Value,
    /// Number of times the job was promoted to running
    pub attempt: u32,
    /// Bumped on every state change; orders writes to the mirror
    pub revision: u64,
    /// When a terminal job is dropped from in-memory tracking
    pub evict_at: Option<DateTime<Utc>>,
    /// Submission order within the manager; last dispatch tie-breaker
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl Job {
    pub(crate) fn new(queue: &str, spec: JobSpec, now: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.to_string(),
            owner: spec.owner,
            job_type: spec.job_type,
            priority: spec.priority,
            status: JobStatus::Queued,
            created_at: now,
            scheduled_at: spec.scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            progress: 0,
            total_items: spec.total_items,
            processed_items: 0,
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
            metadata: spec.metadata,
            attempt: 0,
            revision: 1,
            evict_at: None,
            sequence,
        }
    }

    /// Check if the job may be dispatched at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.scheduled_at <= now
    }

    pub(crate) fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.attempt += 1;
        self.revision += 1;
    }

    /// Check that `attempt` is the job's current running attempt.
    ///
    /// Writebacks from an execution that was superseded by a retry must not
    /// touch the newer attempt.
    pub(crate) fn ensure_attempt(&self, attempt: u32) -> Result<(), QueueError> {
        if self.status == JobStatus::Running && self.attempt != attempt {
            return Err(QueueError::invalid_transition(
                self.id,
                self.status,
                "write back a superseded attempt of",
            ));
        }
        Ok(())
    }

    pub(crate) fn apply_progress(&mut self, update: ProgressUpdate) -> Result<(), QueueError> {
        if self.status != JobStatus::Running {
            return Err(QueueError::invalid_transition(
                self.id,
                self.status,
                "update progress of",
            ));
        }
        if update.processed_items > self.total_items {
            return Err(DomainError::validation(format!(
                "processed items ({}) exceed total items ({})",
                update.processed_items, self.total_items
            ))
            .into());
        }
        let accounted = update.success_count.saturating_add(update.error_count);
        if accounted > update.processed_items {
            return Err(DomainError::validation(format!(
                "success + error counts ({accounted}) exceed processed items ({})",
                update.processed_items
            ))
            .into());
        }

        self.progress = self.progress.max(update.progress.min(100));
        self.processed_items = update.processed_items;
        self.success_count = update.success_count;
        self.error_count = update.error_count;
        self.errors.extend(update.errors);
        self.revision += 1;
        Ok(())
    }

    pub(crate) fn mark_finished(
        &mut self,
        success: bool,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<(), QueueError> {
        if self.status != JobStatus::Running {
            return Err(QueueError::invalid_transition(self.id, self.status, "complete"));
        }
        self.status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.progress = 100;
        self.finish(now, retention);
        Ok(())
    }

    /// Record a failed attempt and either requeue with backoff or fail.
    ///
    /// A retry deadline outside the representable time range fails the job.
    pub(crate) fn mark_attempt_failed(
        &mut self,
        error: String,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<(), QueueError> {
        if self.status != JobStatus::Running {
            return Err(QueueError::invalid_transition(
                self.id,
                self.status,
                "record a failed attempt of",
            ));
        }
        let retry_at = policy
            .should_retry(self.attempt)
            .then(|| policy.delay_for_attempt(self.attempt))
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .and_then(|delay| now.checked_add_signed(delay));

        self.errors.push(format!("attempt {}: {error}", self.attempt));

        if let Some(retry_at) = retry_at {
            self.status = JobStatus::Queued;
            self.scheduled_at = retry_at;
            self.started_at = None;
            self.revision += 1;
            self.progress = 0;
            self.processed_items = 0;
            self.success_count = 0;
            self.error_count = 0;
        } else {
            self.status = JobStatus::Failed;
            self.finish(now, retention);
        }
        Ok(())
    }

    pub(crate) fn mark_cancelled(
        &mut self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<(), QueueError> {
        if self.status != JobStatus::Queued {
            return Err(QueueError::invalid_transition(self.id, self.status, "cancel"));
        }
        self.status = JobStatus::Cancelled;
        self.finish(now, retention);
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>, retention: chrono::Duration) {
        self.completed_at = Some(now);
        self.evict_at = Some(now.checked_add_signed(retention).unwrap_or(now));
        self.revision += 1;
    }
}
