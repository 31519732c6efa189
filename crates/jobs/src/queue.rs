//! Named queue partitions and dispatch candidate selection.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dropqueue_core::{DomainError, DomainResult, JobId};

use crate::types::{BackoffStrategy, Job, JobStatus, MAX_RETRY_DELAY, RetryPolicy};

/// Queue configuration as loaded from config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// Max simultaneously running jobs
    pub concurrency: usize,
    /// Retries after the first failed attempt
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff: BackoffStrategy,
    /// Start paused when false
    pub is_active: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            concurrency: 1,
            retry_attempts: 3,
            retry_delay_ms: 60_000,
            max_retry_delay_ms: 3_600_000,
            backoff: BackoffStrategy::Exponential,
            is_active: true,
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn paused(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            strategy: self.backoff,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("queue name must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(DomainError::validation(format!(
                "queue '{}' must allow at least one running job",
                self.name
            )));
        }
        let limit_ms = MAX_RETRY_DELAY.as_millis() as u64;
        for (key, value) in [
            ("retry_delay_ms", self.retry_delay_ms),
            ("max_retry_delay_ms", self.max_retry_delay_ms),
        ] {
            if value > limit_ms {
                return Err(DomainError::validation(format!(
                    "queue '{}': {key} ({value}) exceeds the {limit_ms} ms limit",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Per-queue counts for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub is_active: bool,
    pub concurrency: usize,
}

/// A named partition with its own concurrency and retry configuration.
#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) name: String,
    pub(crate) concurrency: usize,
    pub(crate) retry: RetryPolicy,
    pub(crate) is_active: bool,
    pub(crate) jobs: HashMap<JobId, Job>,
}

impl Queue {
    pub(crate) fn from_config(config: &QueueConfig) -> Self {
        Self {
            name: config.name.clone(),
            concurrency: config.concurrency,
            retry: config.retry_policy(),
            is_active: config.is_active,
            jobs: HashMap::new(),
        }
    }

    pub(crate) fn running_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    /// Free running slots under the concurrency limit.
    pub(crate) fn available_slots(&self) -> usize {
        self.concurrency.saturating_sub(self.running_count())
    }

    /// Best eligible job: priority descending, then `scheduled_at` ascending,
    /// then submission order.
    pub(crate) fn next_candidate(&self, now: DateTime<Utc>) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .min_by_key(|j| (Reverse(j.priority), j.scheduled_at, j.sequence))
            .map(|j| j.id)
    }

    /// Remove terminal jobs whose retention window has elapsed.
    pub(crate) fn evict_expired(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.evict_at.is_some_and(|at| at <= now))
            .map(|j| j.id)
            .collect();
        for id in &expired {
            self.jobs.remove(id);
        }
        expired
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.jobs.len(),
            is_active: self.is_active,
            concurrency: self.concurrency,
            ..Default::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}
