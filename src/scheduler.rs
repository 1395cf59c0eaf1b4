//! Campaign scheduling: decide which step a user should receive next and
//! materialize it as a pending job. Only one future step per user is ever
//! materialized; the following one is created after the current one is sent.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::db::{self, CreatedJob, Pool};
use crate::model::{
    one_shot_dedupe_key, step_dedupe_key, Job, JobKind, JobStatus, NewJob, Segment, User,
};
use crate::segment::classify;
use crate::steps::{next_step, steps_for, StepDefinition};

/// Business events that can move a user to another segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UserEvent {
    SignedUp,
    IntegrationConnected,
    SubscriptionChanged,
    MarkedActive,
    OptedOut,
}

impl UserEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserEvent::SignedUp => "signed up",
            UserEvent::IntegrationConnected => "integration connected",
            UserEvent::SubscriptionChanged => "subscription changed",
            UserEvent::MarkedActive => "user marked active",
            UserEvent::OptedOut => "opted out",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventOutcome {
    pub cancelled: u64,
    pub scheduled: Option<Job>,
}

fn new_step_job(user_id: i64, step: &StepDefinition, now: DateTime<Utc>) -> NewJob {
    NewJob {
        user_id,
        kind: JobKind::Step,
        segment: Some(step.segment),
        step_label: Some(step.label.to_string()),
        step_ordinal: Some(step.ordinal),
        template: Some(step.template.to_string()),
        scheduled_at: now + step.delay(),
        dedupe_key: step_dedupe_key(user_id, step.segment, step.label),
        metadata: json!({}),
    }
}

/// Create the job for `step` unless its dedupe key is already taken.
async fn materialize(
    pool: &Pool,
    user_id: i64,
    step: &StepDefinition,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    let created = db::create_job(pool, &new_step_job(user_id, step, now), now).await?;
    if !created.inserted {
        debug!(user_id, step = step.label, "step already materialized");
        return Ok(None);
    }
    info!(
        job_id = created.job.id,
        user_id,
        segment = %step.segment,
        step = step.label,
        scheduled_at = %created.job.scheduled_at,
        "campaign step scheduled"
    );
    Ok(Some(created.job))
}

/// Enqueue the first step of the user's current segment that has no job yet.
///
/// Does nothing for unknown, opted-out or paid users, while another step is
/// still pending, or when every step of the segment already has a job.
/// Returns the job created, if any.
#[instrument(skip_all, fields(user_id = user_id))]
pub async fn schedule_next(pool: &Pool, user_id: i64, now: DateTime<Utc>) -> Result<Option<Job>> {
    let Some(user) = db::get_user(pool, user_id).await? else {
        debug!(user_id, "schedule_next: user not found");
        return Ok(None);
    };
    schedule_next_for(pool, &user, now).await
}

pub(crate) async fn schedule_next_for(
    pool: &Pool,
    user: &User,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    if user.marketing_opt_out {
        return Ok(None);
    }
    let Some(segment) = classify(user, now) else {
        debug!(user_id = user.id, "no campaign applies");
        return Ok(None);
    };
    if db::has_pending_step_job(pool, user.id).await? {
        debug!(user_id = user.id, "a step is already pending");
        return Ok(None);
    }
    for step in steps_for(segment) {
        let key = step_dedupe_key(user.id, segment, step.label);
        if db::get_job_by_dedupe_key(pool, &key).await?.is_some() {
            continue;
        }
        return materialize(pool, user.id, step, now).await;
    }
    debug!(user_id = user.id, %segment, "campaign fully scheduled");
    Ok(None)
}

/// Enqueue the step right after `ordinal` in `segment`, timed from `now`.
#[instrument(skip_all, fields(user_id = user_id, segment = %segment, ordinal = ordinal))]
pub async fn schedule_following(
    pool: &Pool,
    user_id: i64,
    segment: Segment,
    ordinal: u32,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    let Some(step) = next_step(segment, ordinal) else {
        info!(user_id, %segment, "campaign sequence complete");
        return Ok(None);
    };
    materialize(pool, user_id, step, now).await
}

/// React to a state change: cancel whatever is pending for the user and
/// schedule from the segment they are in now.
#[instrument(skip_all, fields(user_id = user_id, event = event.as_str()))]
pub async fn handle_user_event(
    pool: &Pool,
    user_id: i64,
    event: UserEvent,
    now: DateTime<Utc>,
) -> Result<EventOutcome> {
    let cancelled = match event {
        UserEvent::SignedUp => 0,
        _ => db::cancel_pending_jobs_for_user(pool, user_id, event.as_str(), None, now).await?,
    };
    if cancelled > 0 {
        info!(user_id, cancelled, reason = event.as_str(), "pending jobs cancelled");
    }
    let scheduled = schedule_next(pool, user_id, now).await?;
    Ok(EventOutcome {
        cancelled,
        scheduled,
    })
}

/// Enqueue a one-shot job tied to a business entity (an invoice, a weekly
/// report, ...). Idempotent per `(user, kind, entity)`.
#[instrument(skip_all, fields(user_id = user_id, kind = kind))]
pub async fn enqueue_one_shot(
    pool: &Pool,
    user_id: i64,
    kind: &str,
    entity_id: &str,
    scheduled_at: DateTime<Utc>,
    metadata: Value,
    now: DateTime<Utc>,
) -> Result<CreatedJob> {
    let new = NewJob {
        user_id,
        kind: JobKind::OneShot,
        segment: None,
        step_label: None,
        step_ordinal: None,
        template: Some(kind.to_string()),
        scheduled_at,
        dedupe_key: one_shot_dedupe_key(user_id, kind, entity_id),
        metadata,
    };
    db::create_job(pool, &new, now).await
}

fn retry_root(key: &str) -> &str {
    match key.rsplit_once(":retry") {
        Some((root, n)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => root,
        _ => key,
    }
}

/// Re-attempt a failed job by creating a superseding pending job for the same
/// step, due immediately. The failed row itself is left untouched.
///
/// Returns `None` when a retry is already pending.
#[instrument(skip_all, fields(job_id = job_id))]
pub async fn retry_failed_job(pool: &Pool, job_id: i64, now: DateTime<Utc>) -> Result<Option<Job>> {
    let job = db::get_job(pool, job_id)
        .await?
        .ok_or_else(|| anyhow!("job {} not found", job_id))?;
    if job.status != JobStatus::Failed {
        return Err(anyhow!(
            "job {} is {}, only failed jobs can be retried",
            job_id,
            job.status.as_str()
        ));
    }
    let root = retry_root(&job.dedupe_key);
    let mut attempt = 1;
    let key = loop {
        let key = format!("{}:retry{}", root, attempt);
        match db::get_job_by_dedupe_key(pool, &key).await? {
            None => break key,
            Some(existing) if existing.status == JobStatus::Pending => {
                debug!(job_id, retry_job_id = existing.id, "retry already pending");
                return Ok(None);
            }
            Some(_) => attempt += 1,
        }
    };
    let new = NewJob {
        user_id: job.user_id,
        kind: job.kind,
        segment: job.segment,
        step_label: job.step_label.clone(),
        step_ordinal: job.step_ordinal,
        template: job.template.clone(),
        scheduled_at: now,
        dedupe_key: key,
        metadata: job.metadata.clone(),
    };
    let created = db::create_job(pool, &new, now).await?;
    info!(job_id, retry_job_id = created.job.id, "failed job re-queued");
    Ok(created.inserted.then_some(created.job))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_root_strips_only_numeric_suffix() {
        assert_eq!(retry_root("campaign:1:lapsed:lapsed-1"), "campaign:1:lapsed:lapsed-1");
        assert_eq!(
            retry_root("campaign:1:lapsed:lapsed-1:retry3"),
            "campaign:1:lapsed:lapsed-1"
        );
        assert_eq!(retry_root("oneshot:1:x:retry"), "oneshot:1:x:retry");
    }

    #[test]
    fn step_job_is_timed_from_now() {
        let now = Utc::now();
        let step = &steps_for(Segment::NotIntegrated)[0];
        let job = new_step_job(9, step, now);
        assert_eq!(job.scheduled_at, now + step.delay());
        assert_eq!(job.dedupe_key, "campaign:9:not-integrated:connect-1");
        assert_eq!(job.step_ordinal, Some(1));
    }
}
