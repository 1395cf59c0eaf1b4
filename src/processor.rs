//! Processing of one due campaign job.
//!
//! Every precondition is re-checked against a fresh user snapshot, because the
//! job row only reflects the user's state at enqueue time.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::RetryPolicy;
use crate::db::{self, Pool};
use crate::model::{Job, JobKind, JobStatus, JobUpdate};
use crate::outbox;
use crate::scheduler;
use crate::segment::classify;
use crate::steps::find_step;
use crate::templates::render_step;
use crate::transport::{MessageTransport, Rejected};

/// Minimum spacing between two sequenced messages to the same user.
pub const FREQUENCY_CAP_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Sent { next_job_id: Option<i64> },
    Cancelled { reason: String },
    /// Frequency cap hit; the job stays pending until `until`.
    Deferred { until: DateTime<Utc> },
    /// Dispatch failed and the retry policy granted another attempt.
    RetryScheduled { attempt: u32, at: DateTime<Utc> },
    Failed { error: String },
    /// The job was no longer pending when its outcome was written.
    Skipped,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Sent { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobOutcome::Failed { .. } | JobOutcome::RetryScheduled { .. }
        )
    }
}

/// Process one due job of any kind.
///
/// The row is re-read first: an earlier job of the same batch may already have
/// cancelled it.
pub async fn process_job(
    pool: &Pool,
    transport: &dyn MessageTransport,
    retry: &RetryPolicy,
    job: &Job,
    now: DateTime<Utc>,
) -> Result<JobOutcome> {
    let job = match db::get_job(pool, job.id).await? {
        Some(current) if current.status == JobStatus::Pending => current,
        current => {
            debug!(job_id = job.id, status = ?current.map(|j| j.status), "job no longer pending");
            return Ok(JobOutcome::Skipped);
        }
    };
    match job.kind {
        JobKind::Step => process_step_job(pool, transport, retry, &job, now).await,
        JobKind::OneShot => outbox::process_one_shot_job(pool, transport, retry, &job, now).await,
    }
}

#[instrument(skip_all, fields(job_id = job.id, user_id = job.user_id, step = ?job.step_label))]
async fn process_step_job(
    pool: &Pool,
    transport: &dyn MessageTransport,
    retry: &RetryPolicy,
    job: &Job,
    now: DateTime<Utc>,
) -> Result<JobOutcome> {
    let Some(user) = db::get_user(pool, job.user_id).await? else {
        return cancel(pool, job, "user not found", now).await;
    };
    if user.marketing_opt_out {
        return cancel(pool, job, "opted out", now).await;
    }
    if user.is_paid() {
        let outcome = cancel(pool, job, "now paid", now).await?;
        let others = db::cancel_pending_jobs_for_user(
            pool,
            user.id,
            "now paid",
            job.claimed_by.as_deref(),
            now,
        )
        .await?;
        if others > 0 {
            info!(user_id = user.id, cancelled = others, "cancelled remaining jobs of paid user");
        }
        return Ok(outcome);
    }

    let current = classify(&user, now);
    if current != job.segment {
        let outcome = cancel(pool, job, "segment changed", now).await?;
        info!(
            user_id = user.id,
            from = ?job.segment,
            to = ?current,
            "segment changed since enqueue"
        );
        scheduler::schedule_next_for(pool, &user, now).await?;
        return Ok(outcome);
    }

    let step = match (job.segment, job.step_ordinal) {
        (Some(segment), Some(ordinal)) => find_step(segment, ordinal),
        _ => None,
    };
    let Some(step) = step else {
        return cancel(pool, job, "unknown step", now).await;
    };

    if let Some(last_sent) = db::get_last_sent_at_for_user(pool, user.id).await? {
        let cap = Duration::hours(FREQUENCY_CAP_HOURS);
        if now - last_sent < cap {
            let until = last_sent + cap;
            if !db::update_job(pool, job.id, &JobUpdate::deferred(until), now).await? {
                return Ok(JobOutcome::Skipped);
            }
            info!(job_id = job.id, %until, "frequency cap: deferred");
            return Ok(JobOutcome::Deferred { until });
        }
    }

    let dispatch = match render_step(step, &user, &job.metadata) {
        Ok(message) => transport.send_sequenced_message(&user, step, &message).await,
        Err(err) => Err(err),
    };
    if let Err(err) = dispatch {
        let error = format!("{:#}", err);
        if err.downcast_ref::<Rejected>().is_some() {
            return fail(pool, job, job.retry_count + 1, &error, now).await;
        }
        return record_failure(pool, job, retry, &error, now).await;
    }

    if !db::update_job(pool, job.id, &JobUpdate::sent(now), now).await? {
        warn!(job_id = job.id, "job changed state while its message was being sent");
        return Ok(JobOutcome::Skipped);
    }
    info!(job_id = job.id, user_id = user.id, step = step.label, "campaign step sent");
    let next = scheduler::schedule_following(pool, user.id, step.segment, step.ordinal, now).await?;
    Ok(JobOutcome::Sent {
        next_job_id: next.map(|j| j.id),
    })
}

/// Move a pending job to `cancelled` with `reason`.
pub(crate) async fn cancel(
    pool: &Pool,
    job: &Job,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<JobOutcome> {
    if !db::update_job(pool, job.id, &JobUpdate::cancelled(reason), now).await? {
        return Ok(JobOutcome::Skipped);
    }
    info!(job_id = job.id, user_id = job.user_id, reason, "job cancelled");
    Ok(JobOutcome::Cancelled {
        reason: reason.to_string(),
    })
}

/// Record a dispatch failure. Depending on the retry policy the job is pushed
/// back with exponential delay or marked `failed`.
pub(crate) async fn record_failure(
    pool: &Pool,
    job: &Job,
    retry: &RetryPolicy,
    error: &str,
    now: DateTime<Utc>,
) -> Result<JobOutcome> {
    let failures = job.retry_count + 1;
    if retry.should_retry(failures) {
        let at = now + retry.backoff(job.retry_count);
        let update = JobUpdate {
            scheduled_at: Some(at),
            retry_count: Some(failures),
            last_error: Some(error.to_string()),
            ..Default::default()
        };
        if !db::update_job(pool, job.id, &update, now).await? {
            return Ok(JobOutcome::Skipped);
        }
        warn!(job_id = job.id, attempt = failures, %at, error, "dispatch failed; retry scheduled");
        return Ok(JobOutcome::RetryScheduled {
            attempt: failures,
            at,
        });
    }
    fail(pool, job, failures, error, now).await
}

/// Mark a pending job `failed` without consulting the retry policy.
pub(crate) async fn fail(
    pool: &Pool,
    job: &Job,
    failures: u32,
    error: &str,
    now: DateTime<Utc>,
) -> Result<JobOutcome> {
    let update = JobUpdate {
        status: Some(JobStatus::Failed),
        retry_count: Some(failures),
        last_error: Some(error.to_string()),
        ..Default::default()
    };
    if !db::update_job(pool, job.id, &update, now).await? {
        return Ok(JobOutcome::Skipped);
    }
    warn!(job_id = job.id, user_id = job.user_id, error, "job failed");
    Ok(JobOutcome::Failed {
        error: error.to_string(),
    })
}
