//! In-process priority job queues.
//!
//! Named queues with per-queue concurrency limits, dispatched by priority
//! then scheduled time on a periodic tick. Job state is authoritative in
//! memory and mirrored best-effort to an external store.
//!
//! ```no_run
//! use dropqueue_jobs::{HandlerRegistry, JobQueueManager, JobSpec, ManagerConfig, QueueConfig};
//!
//! let handlers = HandlerRegistry::new().with("import", |ctx| {
//!     tracing::info!(job_id = %ctx.job_id(), "importing");
//!     Ok(())
//! });
//!
//! let manager = JobQueueManager::builder()
//!     .config(ManagerConfig::default())
//!     .queue(QueueConfig::new("imports", 3))
//!     .handlers(handlers)
//!     .build()?;
//!
//! let job_id = manager.submit("imports", JobSpec::new("import").total_items(120))?;
//! # let _ = job_id;
//! # Ok::<(), dropqueue_jobs::QueueError>(())
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod manager;
pub mod mirror;
pub mod queue;
pub mod types;

pub use config::{ConfigError, ManagerConfig, PromotionPolicy};
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use error::{ExecutionError, MirrorError, QueueError};
pub use executor::{HandlerRegistry, JobContext, JobHandler};
pub use manager::{JobQueueManager, JobQueueManagerBuilder, TickReport};
pub use mirror::{InMemoryMirror, JobMirror, MirrorRecord, NoopMirror};
#[cfg(feature = "postgres")]
pub use mirror::PostgresJobMirror;
pub use queue::{QueueConfig, QueueStats};
pub use types::{BackoffStrategy, Job, JobSpec, JobStatus, Priority, ProgressUpdate, RetryPolicy};

pub use dropqueue_core::{Clock, JobId, ManualClock, SystemClock, TenantId};
