//! View models returned by repositories.
//!
//! Keep these focused on what the queries return. Scheduling logic lives in
//! higher layers.

use crate::model::{Job, OutboxNotification};
use serde::Serialize;

/// Result of an idempotent job insert.
#[derive(Debug, Clone)]
pub struct CreatedJob {
    /// The row stored under the dedupe key, new or pre-existing.
    pub job: Job,
    /// False when a job with the same dedupe key already existed.
    pub inserted: bool,
}

#[derive(Debug, Clone)]
pub struct CreatedNotification {
    pub notification: OutboxNotification,
    pub inserted: bool,
}

/// Job totals per status, used by the status surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: i64,
    pub sent: i64,
    pub cancelled: i64,
    pub failed: i64,
}
