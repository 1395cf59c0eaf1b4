//! One-shot delivery: outbox notifications and one-shot campaign jobs.
//!
//! Each item is a single unit of work; nothing here chains or reschedules
//! follow-up messages.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::config::RetryPolicy;
use crate::db::{self, CreatedNotification, Pool};
use crate::model::{
    Job, JobUpdate, NewNotification, NotificationChannel, NotificationStatus, OutboxNotification,
};
use crate::processor::{cancel, fail, record_failure, JobOutcome};
use crate::templates::render_notification;
use crate::transport::MessageTransport;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Items that were no longer pending when their outcome was written.
    pub skipped: usize,
}

pub async fn enqueue_notification(
    pool: &Pool,
    new: &NewNotification,
    now: DateTime<Utc>,
) -> Result<CreatedNotification> {
    let created = db::create_notification(pool, new, now).await?;
    if created.inserted {
        info!(
            notification_id = created.notification.id,
            user_id = new.user_id,
            kind = %new.kind,
            "notification queued"
        );
    }
    Ok(created)
}

/// Deliver up to `limit` due outbox notifications. Failures are recorded per
/// notification; only a failed claim aborts the call.
#[instrument(skip_all)]
pub async fn process_pending(
    pool: &Pool,
    transport: &dyn MessageTransport,
    limit: u32,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<OutboxReport> {
    let items = db::claim_due_notifications(pool, limit, now, lease).await?;
    let mut report = OutboxReport {
        claimed: items.len(),
        ..Default::default()
    };
    for item in &items {
        let (status, reason) = match deliver(pool, transport, item).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(?err, notification_id = item.id, "notification delivery errored");
                (NotificationStatus::Failed, format!("{:#}", err))
            }
        };
        match db::finish_notification(pool, item.id, status, &reason, now).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(notification_id = item.id, "notification changed state during delivery");
                report.skipped += 1;
                continue;
            }
            Err(err) => {
                warn!(?err, notification_id = item.id, "failed to record notification outcome");
                report.failed += 1;
                continue;
            }
        }
        match status {
            NotificationStatus::Sent => report.sent += 1,
            _ => report.failed += 1,
        }
        info!(
            notification_id = item.id,
            status = status.as_str(),
            reason = %reason,
            "notification processed"
        );
    }
    Ok(report)
}

async fn deliver(
    pool: &Pool,
    transport: &dyn MessageTransport,
    item: &OutboxNotification,
) -> Result<(NotificationStatus, String)> {
    let Some(user) = db::get_user(pool, item.user_id).await? else {
        return Ok((NotificationStatus::Failed, "user not found".into()));
    };
    if user.contact_address().is_none() {
        return Ok((NotificationStatus::Failed, "no contact address".into()));
    }
    match NotificationChannel::parse(&item.channel) {
        Some(NotificationChannel::Email) => {
            let message = render_notification(item, &user);
            if transport.send_one_shot_message(&user, item, &message).await? {
                Ok((NotificationStatus::Sent, "email sent".into()))
            } else {
                Ok((NotificationStatus::Failed, "rejected by transport".into()))
            }
        }
        // Read by the in-app inbox; nothing to deliver.
        Some(NotificationChannel::InApp) => Ok((NotificationStatus::Sent, "in-app".into())),
        None => Ok((
            NotificationStatus::Failed,
            format!("unknown channel: {}", item.channel),
        )),
    }
}

/// View of a one-shot job as a notification, so both paths share rendering
/// and transport.
fn job_as_notification(job: &Job) -> OutboxNotification {
    let kind = job.template.clone().unwrap_or_else(|| "one_shot".to_string());
    let text = |key: &str| {
        job.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    OutboxNotification {
        id: job.id,
        user_id: job.user_id,
        title: text("title").unwrap_or_else(|| kind.clone()),
        body: text("body").unwrap_or_default(),
        kind,
        channel: NotificationChannel::Email.as_str().to_string(),
        data: job.metadata.clone(),
        dedupe_key: job.dedupe_key.clone(),
        status: NotificationStatus::Pending,
        reason: None,
        scheduled_at: job.scheduled_at,
        sent_at: None,
        created_at: job.created_at,
    }
}

#[instrument(skip_all, fields(job_id = job.id, user_id = job.user_id))]
pub(crate) async fn process_one_shot_job(
    pool: &Pool,
    transport: &dyn MessageTransport,
    retry: &RetryPolicy,
    job: &Job,
    now: DateTime<Utc>,
) -> Result<JobOutcome> {
    let Some(user) = db::get_user(pool, job.user_id).await? else {
        return cancel(pool, job, "user not found", now).await;
    };
    if user.contact_address().is_none() {
        return fail(pool, job, job.retry_count + 1, "no contact address", now).await;
    }
    let notification = job_as_notification(job);
    let message = render_notification(&notification, &user);
    match transport
        .send_one_shot_message(&user, &notification, &message)
        .await
    {
        Ok(true) => {
            if !db::update_job(pool, job.id, &JobUpdate::sent(now), now).await? {
                return Ok(JobOutcome::Skipped);
            }
            info!(job_id = job.id, kind = %notification.kind, "one-shot message sent");
            Ok(JobOutcome::Sent { next_job_id: None })
        }
        Ok(false) => fail(pool, job, job.retry_count + 1, "rejected by transport", now).await,
        Err(err) => record_failure(pool, job, retry, &format!("{:#}", err), now).await,
    }
}
