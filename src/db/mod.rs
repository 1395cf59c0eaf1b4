//! Database module: row view models and SQL repositories.
//!
//! - `model`: small structs returned by repository calls.
//! - `repo`: SQL-only functions for users, campaign jobs, outbox
//!   notifications and persisted settings.
//!
//! Callers import from `lifecycle_mailer::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{CreatedJob, CreatedNotification, JobCounts};
