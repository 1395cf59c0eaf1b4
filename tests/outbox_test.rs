mod common;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;

use common::{setup_pool, t0, trial_user, RecordingTransport, Sent};
use lifecycle_mailer::db;
use lifecycle_mailer::model::{NewNotification, NotificationStatus, OutboxNotification, User};
use lifecycle_mailer::outbox;
use lifecycle_mailer::steps::StepDefinition;
use lifecycle_mailer::templates::RenderedMessage;
use lifecycle_mailer::transport::MessageTransport;

fn notification(user_id: i64, kind: &str, channel: &str) -> NewNotification {
    NewNotification {
        user_id,
        kind: kind.into(),
        channel: channel.into(),
        title: "Your week".into(),
        body: "Nice work".into(),
        data: json!({"activities": 4}),
        dedupe_key: None,
        scheduled_at: t0(),
    }
}

async fn run(pool: &sqlx::SqlitePool, transport: &RecordingTransport) -> outbox::OutboxReport {
    outbox::process_pending(pool, transport, 50, Duration::minutes(15), t0())
        .await
        .unwrap()
}

async fn stored(pool: &sqlx::SqlitePool, id: i64) -> (NotificationStatus, Option<String>) {
    let n = db::get_notification(pool, id).await.unwrap().unwrap();
    (n.status, n.reason)
}

#[tokio::test]
async fn email_notification_is_rendered_and_sent() {
    let pool = setup_pool().await;
    let transport = RecordingTransport::new();
    trial_user(&pool, 1, t0()).await;
    let created = outbox::enqueue_notification(&pool, &notification(1, "weekly_summary", "email"), t0())
        .await
        .unwrap();
    assert!(created.inserted);
    assert_eq!(
        created.notification.dedupe_key,
        "notification:1:weekly_summary:Your week"
    );

    let report = run(&pool, &transport).await;
    assert_eq!(report.claimed, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(
        stored(&pool, created.notification.id).await,
        (NotificationStatus::Sent, Some("email sent".into()))
    );
    assert_eq!(
        transport.sent().await,
        vec![Sent::OneShot {
            user_id: 1,
            kind: "weekly_summary".into(),
            subject: "Your week in training".into(),
        }]
    );

    // Drained: nothing left to claim.
    assert_eq!(run(&pool, &transport).await.claimed, 0);
}

#[tokio::test]
async fn duplicate_enqueue_is_a_no_op() {
    let pool = setup_pool().await;
    let first = outbox::enqueue_notification(&pool, &notification(1, "weekly_summary", "email"), t0())
        .await
        .unwrap();
    let second = outbox::enqueue_notification(&pool, &notification(1, "weekly_summary", "email"), t0())
        .await
        .unwrap();
    assert!(!second.inserted);
    assert_eq!(first.notification.id, second.notification.id);
}

#[tokio::test]
async fn in_app_notification_needs_no_transport() {
    let pool = setup_pool().await;
    let transport = RecordingTransport::new();
    trial_user(&pool, 2, t0()).await;
    let created = outbox::enqueue_notification(&pool, &notification(2, "weekly_summary", "in_app"), t0())
        .await
        .unwrap();

    let report = run(&pool, &transport).await;
    assert_eq!(report.sent, 1);
    assert_eq!(
        stored(&pool, created.notification.id).await,
        (NotificationStatus::Sent, Some("in-app".into()))
    );
    assert!(transport.sent().await.is_empty());
}

#[tokio::test]
async fn undeliverable_notifications_fail_with_a_reason() {
    let pool = setup_pool().await;
    let transport = RecordingTransport::new();
    trial_user(&pool, 3, t0()).await;
    db::upsert_user(&pool, &User::new(4, None, t0())).await.unwrap();

    let unknown_channel = outbox::enqueue_notification(&pool, &notification(3, "weekly_summary", "sms"), t0())
        .await
        .unwrap();
    let missing_user = outbox::enqueue_notification(&pool, &notification(99, "weekly_summary", "email"), t0())
        .await
        .unwrap();
    let no_email = outbox::enqueue_notification(&pool, &notification(4, "weekly_summary", "email"), t0())
        .await
        .unwrap();

    let report = run(&pool, &transport).await;
    assert_eq!(report.claimed, 3);
    assert_eq!(report.failed, 3);
    assert_eq!(
        stored(&pool, unknown_channel.notification.id).await,
        (NotificationStatus::Failed, Some("unknown channel: sms".into()))
    );
    assert_eq!(
        stored(&pool, missing_user.notification.id).await,
        (NotificationStatus::Failed, Some("user not found".into()))
    );
    assert_eq!(
        stored(&pool, no_email.notification.id).await,
        (NotificationStatus::Failed, Some("no contact address".into()))
    );
    assert!(transport.sent().await.is_empty());
}

#[tokio::test]
async fn transport_rejection_and_errors_fail_the_notification() {
    let pool = setup_pool().await;
    let transport = RecordingTransport::new();
    trial_user(&pool, 5, t0()).await;
    let mut rejected = notification(5, "payment_failed", "email");
    rejected.dedupe_key = Some("invoice:1".into());
    let mut errored = notification(5, "payment_failed", "email");
    errored.dedupe_key = Some("invoice:2".into());
    errored.scheduled_at = t0() + Duration::seconds(1);
    let rejected = outbox::enqueue_notification(&pool, &rejected, t0()).await.unwrap();
    let errored = outbox::enqueue_notification(&pool, &errored, t0()).await.unwrap();

    transport.push_one_shot_response(Ok(false)).await;
    transport
        .push_one_shot_response(Err(anyhow::anyhow!("gateway timeout")))
        .await;

    let report = outbox::process_pending(&pool, &transport, 50, Duration::minutes(15), t0() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(
        stored(&pool, rejected.notification.id).await,
        (NotificationStatus::Failed, Some("rejected by transport".into()))
    );
    let (status, reason) = stored(&pool, errored.notification.id).await;
    assert_eq!(status, NotificationStatus::Failed);
    assert!(reason.unwrap().contains("gateway timeout"));
}

#[tokio::test]
async fn future_notifications_wait() {
    let pool = setup_pool().await;
    let transport = RecordingTransport::new();
    trial_user(&pool, 6, t0()).await;
    let mut later = notification(6, "weekly_summary", "email");
    later.scheduled_at = t0() + Duration::hours(2);
    outbox::enqueue_notification(&pool, &later, t0()).await.unwrap();

    assert_eq!(run(&pool, &transport).await.claimed, 0);
}

/// Transport that lets another writer settle the notification while the
/// send is in flight, as when a lease lapses mid-delivery.
struct SettledElsewhere {
    pool: sqlx::SqlitePool,
}

#[async_trait]
impl MessageTransport for SettledElsewhere {
    async fn send_sequenced_message(
        &self,
        _user: &User,
        _step: &StepDefinition,
        _message: &RenderedMessage,
    ) -> Result<()> {
        Ok(())
    }

    async fn send_one_shot_message(
        &self,
        _user: &User,
        notification: &OutboxNotification,
        _message: &RenderedMessage,
    ) -> Result<bool> {
        db::finish_notification(
            &self.pool,
            notification.id,
            NotificationStatus::Failed,
            "handled by another worker",
            t0(),
        )
        .await?;
        Ok(true)
    }
}

#[tokio::test]
async fn notification_settled_during_delivery_counts_as_skipped() {
    let pool = setup_pool().await;
    trial_user(&pool, 7, t0()).await;
    let created = outbox::enqueue_notification(&pool, &notification(7, "weekly_summary", "email"), t0())
        .await
        .unwrap();

    let transport = SettledElsewhere { pool: pool.clone() };
    let report = outbox::process_pending(&pool, &transport, 50, Duration::minutes(15), t0())
        .await
        .unwrap();
    assert_eq!(
        report,
        outbox::OutboxReport {
            claimed: 1,
            sent: 0,
            failed: 0,
            skipped: 1,
        }
    );
    // The first recorded outcome stands.
    assert_eq!(
        stored(&pool, created.notification.id).await,
        (NotificationStatus::Failed, Some("handled by another worker".into()))
    );
}
