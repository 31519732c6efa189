//! Shared building blocks for the job queue crates.
//!
//! Identifiers, validation errors and the clock abstraction. No queue logic
//! lives here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, TenantId};
