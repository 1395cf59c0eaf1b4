use super::model::{CreatedJob, CreatedNotification, JobCounts};
use crate::model::{
    Job, JobKind, JobStatus, JobUpdate, NewJob, NewNotification, NotificationStatus,
    OutboxNotification, Segment, SubscriptionStatus, SubscriptionTier, User, UserUpdate,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

/// Settings key holding the worker on/off switch.
pub const WORKER_ENABLED_KEY: &str = "campaign_worker_enabled";

const JOB_COLUMNS: &str = "id, user_id, kind, segment, step_label, step_ordinal, template, \
     scheduled_at, dedupe_key, status, retry_count, metadata, sent_at, last_error, \
     claimed_by, created_at, updated_at";

const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, channel, title, body, data, dedupe_key, \
     status, reason, scheduled_at, sent_at, created_at";

const USER_COLUMNS: &str = "id, email, display_name, integration_connected, subscription_status, \
     subscription_tier, last_seen_at, marketing_opt_out, created_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // WAL lets the admin CLI read while the worker writes.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    // Create the file on first start.
    if !rebuilt.contains("mode=") {
        rebuilt.push(if query_part.is_some() { '&' } else { '?' });
        rebuilt.push_str("mode=rwc");
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ── Users ───────────────────────────────────────────────────────────

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let status: String = row.try_get("subscription_status")?;
    let tier: String = row.try_get("subscription_tier")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        integration_connected: row.try_get("integration_connected")?,
        subscription_status: SubscriptionStatus::parse(&status),
        subscription_tier: SubscriptionTier::parse(&tier),
        last_seen_at: row.try_get("last_seen_at")?,
        marketing_opt_out: row.try_get("marketing_opt_out")?,
        created_at: row.try_get("created_at")?,
    })
}

#[instrument(skip_all, fields(user_id = user.id))]
pub async fn upsert_user(pool: &Pool, user: &User) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, email, display_name, integration_connected, subscription_status, \
         subscription_tier, last_seen_at, marketing_opt_out, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET email = excluded.email, \
         display_name = excluded.display_name, \
         integration_connected = excluded.integration_connected, \
         subscription_status = excluded.subscription_status, \
         subscription_tier = excluded.subscription_tier, \
         last_seen_at = excluded.last_seen_at, \
         marketing_opt_out = excluded.marketing_opt_out",
    )
    .bind(user.id)
    .bind(user.email.as_deref())
    .bind(user.display_name.as_deref())
    .bind(user.integration_connected)
    .bind(user.subscription_status.as_str())
    .bind(user.subscription_tier.as_str())
    .bind(user.last_seen_at)
    .bind(user.marketing_opt_out)
    .bind(user.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_user(pool: &Pool, user_id: i64) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

/// Apply a partial update. Returns false when the user does not exist.
#[instrument(skip_all, fields(user_id = user_id))]
pub async fn update_user(pool: &Pool, user_id: i64, update: &UserUpdate) -> Result<bool> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE users SET id = id");
    if let Some(email) = &update.email {
        qb.push(", email = ").push_bind(email.clone());
    }
    if let Some(connected) = update.integration_connected {
        qb.push(", integration_connected = ").push_bind(connected);
    }
    if let Some(status) = update.subscription_status {
        qb.push(", subscription_status = ").push_bind(status.as_str());
    }
    if let Some(tier) = update.subscription_tier {
        qb.push(", subscription_tier = ").push_bind(tier.as_str());
    }
    if let Some(seen) = update.last_seen_at {
        qb.push(", last_seen_at = ").push_bind(seen);
    }
    if let Some(opt_out) = update.marketing_opt_out {
        qb.push(", marketing_opt_out = ").push_bind(opt_out);
    }
    qb.push(" WHERE id = ").push_bind(user_id);
    let res = qb.build().execute(pool).await?;
    Ok(res.rows_affected() > 0)
}

// ── Campaign jobs ───────────────────────────────────────────────────

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id: i64 = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let segment: Option<String> = row.try_get("segment")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Job {
        id,
        user_id: row.try_get("user_id")?,
        kind: JobKind::parse(&kind).ok_or_else(|| anyhow!("job {} has unknown kind {}", id, kind))?,
        segment: segment.as_deref().and_then(Segment::parse),
        step_label: row.try_get("step_label")?,
        step_ordinal: row
            .try_get::<Option<i64>, _>("step_ordinal")?
            .map(|o| o as u32),
        template: row.try_get("template")?,
        scheduled_at: row.try_get("scheduled_at")?,
        dedupe_key: row.try_get("dedupe_key")?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| anyhow!("job {} has unknown status {}", id, status))?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        metadata: serde_json::from_str(&metadata)
            .with_context(|| format!("job {} has malformed metadata", id))?,
        sent_at: row.try_get("sent_at")?,
        last_error: row.try_get("last_error")?,
        claimed_by: row.try_get("claimed_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a pending job unless one with the same dedupe key already exists,
/// whatever its status. Either way the stored job is returned.
#[instrument(skip_all, fields(dedupe_key = %new.dedupe_key))]
pub async fn create_job(pool: &Pool, new: &NewJob, now: DateTime<Utc>) -> Result<CreatedJob> {
    let metadata = serde_json::to_string(&new.metadata)?;
    let inserted = sqlx::query(
        "INSERT INTO campaign_jobs (user_id, kind, segment, step_label, step_ordinal, template, \
         scheduled_at, dedupe_key, status, retry_count, metadata, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?) \
         ON CONFLICT(dedupe_key) DO NOTHING RETURNING id",
    )
    .bind(new.user_id)
    .bind(new.kind.as_str())
    .bind(new.segment.map(|s| s.as_str()))
    .bind(new.step_label.as_deref())
    .bind(new.step_ordinal.map(i64::from))
    .bind(new.template.as_deref())
    .bind(new.scheduled_at)
    .bind(&new.dedupe_key)
    .bind(metadata)
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?
    .is_some();

    let job = get_job_by_dedupe_key(pool, &new.dedupe_key)
        .await?
        .ok_or_else(|| anyhow!("job {} vanished after insert", new.dedupe_key))?;
    Ok(CreatedJob { job, inserted })
}

#[instrument(skip_all)]
pub async fn get_job(pool: &Pool, id: i64) -> Result<Option<Job>> {
    let row = sqlx::query(&format!("SELECT {} FROM campaign_jobs WHERE id = ?", JOB_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_job_by_dedupe_key(pool: &Pool, key: &str) -> Result<Option<Job>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM campaign_jobs WHERE dedupe_key = ?",
        JOB_COLUMNS
    ))
    .bind(key)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Apply a partial update to a job that is still pending and release any
/// claim on it. Returns false when the job is missing or already terminal,
/// so `sent`, `cancelled` and `failed` rows are never rewritten.
#[instrument(skip_all, fields(job_id = id))]
pub async fn update_job(
    pool: &Pool,
    id: i64,
    update: &JobUpdate,
    now: DateTime<Utc>,
) -> Result<bool> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE campaign_jobs SET updated_at = ");
    qb.push_bind(now);
    qb.push(", claimed_by = NULL, claimed_until = NULL");
    if let Some(status) = update.status {
        qb.push(", status = ").push_bind(status.as_str());
    }
    if let Some(at) = update.scheduled_at {
        qb.push(", scheduled_at = ").push_bind(at);
    }
    if let Some(count) = update.retry_count {
        qb.push(", retry_count = ").push_bind(i64::from(count));
    }
    if let Some(at) = update.sent_at {
        qb.push(", sent_at = ").push_bind(at);
    }
    if let Some(err) = &update.last_error {
        qb.push(", last_error = ").push_bind(err.clone());
    }
    if let Some(metadata) = &update.metadata {
        qb.push(", metadata = ")
            .push_bind(serde_json::to_string(metadata)?);
    }
    qb.push(" WHERE id = ")
        .push_bind(id)
        .push(" AND status = 'pending'");
    let res = qb.build().execute(pool).await?;
    Ok(res.rows_affected() > 0)
}

/// Pending jobs that are due at `now`, oldest first. Read-only.
#[instrument(skip_all)]
pub async fn list_due_jobs(pool: &Pool, limit: u32, now: DateTime<Utc>) -> Result<Vec<Job>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM campaign_jobs \
         WHERE status = 'pending' AND julianday(scheduled_at) <= julianday(?) \
         ORDER BY julianday(scheduled_at) ASC, id ASC LIMIT ?",
        JOB_COLUMNS
    ))
    .bind(now)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

/// Atomically lease up to `limit` due jobs to `worker_id`, oldest first.
///
/// Rows already leased by a live claim are skipped, so two workers sharing the
/// database never receive the same job while the lease holds. The lease is
/// released by the next `update_job` on the row or when it expires.
#[instrument(skip_all, fields(worker_id = worker_id))]
pub async fn claim_due_jobs(
    pool: &Pool,
    worker_id: &str,
    limit: u32,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Vec<Job>> {
    let rows = sqlx::query(&format!(
        "UPDATE campaign_jobs SET claimed_by = ?, claimed_until = ? \
         WHERE id IN ( \
             SELECT id FROM campaign_jobs \
             WHERE status = 'pending' AND julianday(scheduled_at) <= julianday(?) \
               AND (claimed_until IS NULL OR julianday(claimed_until) <= julianday(?)) \
             ORDER BY julianday(scheduled_at) ASC, id ASC LIMIT ?) \
         RETURNING {}",
        JOB_COLUMNS
    ))
    .bind(worker_id)
    .bind(now + lease)
    .bind(now)
    .bind(now)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
    // RETURNING does not preserve the subquery order.
    jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
    Ok(jobs)
}

/// Cancel every pending job of a user that no other worker currently holds a
/// lease on. Jobs leased by `holder` are cancelled too, so a worker can sweep
/// the rest of its own batch. Idempotent; returns the number of rows that
/// changed. A job claimed elsewhere is left to its worker, which re-validates
/// the user before sending.
#[instrument(skip_all, fields(user_id = user_id, reason = reason))]
pub async fn cancel_pending_jobs_for_user(
    pool: &Pool,
    user_id: i64,
    reason: &str,
    holder: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE campaign_jobs SET status = 'cancelled', last_error = ?, updated_at = ?, \
         claimed_by = NULL, claimed_until = NULL \
         WHERE user_id = ? AND status = 'pending' \
           AND (claimed_until IS NULL OR julianday(claimed_until) <= julianday(?) \
                OR claimed_by = ?)",
    )
    .bind(reason)
    .bind(now)
    .bind(user_id)
    .bind(now)
    .bind(holder)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Time of the most recent sequenced message successfully sent to a user.
#[instrument(skip_all)]
pub async fn get_last_sent_at_for_user(pool: &Pool, user_id: i64) -> Result<Option<DateTime<Utc>>> {
    let sent_at: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
        "SELECT sent_at FROM campaign_jobs \
         WHERE user_id = ? AND kind = 'step' AND status = 'sent' AND sent_at IS NOT NULL \
         ORDER BY julianday(sent_at) DESC LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(sent_at.flatten())
}

/// Whether the user already has a sequenced step waiting to fire.
#[instrument(skip_all)]
pub async fn has_pending_step_job(pool: &Pool, user_id: i64) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM campaign_jobs \
         WHERE user_id = ? AND kind = 'step' AND status = 'pending' LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

#[instrument(skip_all)]
pub async fn list_jobs_for_user(pool: &Pool, user_id: i64) -> Result<Vec<Job>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM campaign_jobs WHERE user_id = ? ORDER BY id ASC",
        JOB_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

pub async fn count_jobs_by_status(pool: &Pool) -> Result<JobCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM campaign_jobs GROUP BY status")
            .fetch_all(pool)
            .await?;
    let mut counts = JobCounts::default();
    for (status, n) in rows {
        match JobStatus::parse(&status) {
            Some(JobStatus::Pending) => counts.pending = n,
            Some(JobStatus::Sent) => counts.sent = n,
            Some(JobStatus::Cancelled) => counts.cancelled = n,
            Some(JobStatus::Failed) => counts.failed = n,
            None => {}
        }
    }
    Ok(counts)
}

// ── Outbox notifications ────────────────────────────────────────────

fn notification_from_row(row: &SqliteRow) -> Result<OutboxNotification> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let data: String = row.try_get("data")?;
    Ok(OutboxNotification {
        id,
        user_id: row.try_get("user_id")?,
        kind: row.try_get("kind")?,
        channel: row.try_get("channel")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        data: serde_json::from_str::<Value>(&data)
            .with_context(|| format!("notification {} has malformed data", id))?,
        dedupe_key: row.try_get("dedupe_key")?,
        status: NotificationStatus::parse(&status)
            .ok_or_else(|| anyhow!("notification {} has unknown status {}", id, status))?,
        reason: row.try_get("reason")?,
        scheduled_at: row.try_get("scheduled_at")?,
        sent_at: row.try_get("sent_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[instrument(skip_all)]
pub async fn create_notification(
    pool: &Pool,
    new: &NewNotification,
    now: DateTime<Utc>,
) -> Result<CreatedNotification> {
    let key = new.effective_dedupe_key();
    let inserted = sqlx::query(
        "INSERT INTO notifications (user_id, kind, channel, title, body, data, dedupe_key, \
         status, scheduled_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?) \
         ON CONFLICT(dedupe_key) DO NOTHING RETURNING id",
    )
    .bind(new.user_id)
    .bind(&new.kind)
    .bind(&new.channel)
    .bind(&new.title)
    .bind(&new.body)
    .bind(serde_json::to_string(&new.data)?)
    .bind(&key)
    .bind(new.scheduled_at)
    .bind(now)
    .fetch_optional(pool)
    .await?
    .is_some();

    let notification = get_notification_by_dedupe_key(pool, &key)
        .await?
        .ok_or_else(|| anyhow!("notification {} vanished after insert", key))?;
    Ok(CreatedNotification {
        notification,
        inserted,
    })
}

pub async fn get_notification(pool: &Pool, id: i64) -> Result<Option<OutboxNotification>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM notifications WHERE id = ?",
        NOTIFICATION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(notification_from_row).transpose()
}

pub async fn get_notification_by_dedupe_key(
    pool: &Pool,
    key: &str,
) -> Result<Option<OutboxNotification>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM notifications WHERE dedupe_key = ?",
        NOTIFICATION_COLUMNS
    ))
    .bind(key)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(notification_from_row).transpose()
}

/// Lease due pending notifications, oldest first. Same contract as
/// `claim_due_jobs`.
#[instrument(skip_all)]
pub async fn claim_due_notifications(
    pool: &Pool,
    limit: u32,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Vec<OutboxNotification>> {
    let rows = sqlx::query(&format!(
        "UPDATE notifications SET claimed_until = ? \
         WHERE id IN ( \
             SELECT id FROM notifications \
             WHERE status = 'pending' AND julianday(scheduled_at) <= julianday(?) \
               AND (claimed_until IS NULL OR julianday(claimed_until) <= julianday(?)) \
             ORDER BY julianday(scheduled_at) ASC, id ASC LIMIT ?) \
         RETURNING {}",
        NOTIFICATION_COLUMNS
    ))
    .bind(now + lease)
    .bind(now)
    .bind(now)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    let mut items = rows
        .iter()
        .map(notification_from_row)
        .collect::<Result<Vec<_>>>()?;
    items.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
    Ok(items)
}

/// Record the terminal outcome of a pending notification. Returns false when
/// it was not pending anymore.
#[instrument(skip_all, fields(notification_id = id, status = status.as_str()))]
pub async fn finish_notification(
    pool: &Pool,
    id: i64,
    status: NotificationStatus,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let sent_at = (status == NotificationStatus::Sent).then_some(now);
    let res = sqlx::query(
        "UPDATE notifications SET status = ?, reason = ?, sent_at = COALESCE(?, sent_at), \
         claimed_until = NULL WHERE id = ? AND status = 'pending'",
    )
    .bind(status.as_str())
    .bind(reason)
    .bind(sent_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

// ── Settings ────────────────────────────────────────────────────────

pub async fn get_setting(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_setting(pool: &Pool, key: &str, value: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persisted worker switch, if one has ever been stored.
pub async fn get_worker_enabled(pool: &Pool) -> Result<Option<bool>> {
    Ok(get_setting(pool, WORKER_ENABLED_KEY)
        .await?
        .map(|v| v != "false"))
}

/// Persisted worker switch; enabled unless explicitly turned off.
pub async fn load_worker_enabled(pool: &Pool) -> Result<bool> {
    Ok(get_worker_enabled(pool).await?.unwrap_or(true))
}

pub async fn store_worker_enabled(pool: &Pool, enabled: bool, now: DateTime<Utc>) -> Result<()> {
    set_setting(pool, WORKER_ENABLED_KEY, if enabled { "true" } else { "false" }, now).await
}
