#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use lifecycle_mailer::db;
use lifecycle_mailer::model::{OutboxNotification, SubscriptionStatus, User};
use lifecycle_mailer::steps::StepDefinition;
use lifecycle_mailer::templates::RenderedMessage;
use lifecycle_mailer::transport::MessageTransport;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
}

/// Fresh signup that has not connected an integration.
pub async fn signup(pool: &sqlx::SqlitePool, id: i64, now: DateTime<Utc>) -> User {
    let user = User::new(id, Some(&format!("user{}@example.com", id)), now);
    db::upsert_user(pool, &user).await.unwrap();
    user
}

/// Connected user on a running trial.
pub async fn trial_user(pool: &sqlx::SqlitePool, id: i64, now: DateTime<Utc>) -> User {
    let mut user = User::new(id, Some(&format!("user{}@example.com", id)), now);
    user.integration_connected = true;
    user.subscription_status = SubscriptionStatus::Trialing;
    db::upsert_user(pool, &user).await.unwrap();
    user
}

/// Connected user without a subscription, which classifies as lapsed.
pub async fn lapsed_user(pool: &sqlx::SqlitePool, id: i64, now: DateTime<Utc>) -> User {
    let mut user = User::new(id, Some(&format!("user{}@example.com", id)), now);
    user.integration_connected = true;
    db::upsert_user(pool, &user).await.unwrap();
    user
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Step { user_id: i64, label: String, subject: String },
    OneShot { user_id: i64, kind: String, subject: String },
}

/// Transport double: records every message and replays queued responses,
/// succeeding once the queues are empty.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<Sent>>>,
    step_responses: Arc<Mutex<VecDeque<Result<()>>>>,
    one_shot_responses: Arc<Mutex<VecDeque<Result<bool>>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_step_response(&self, response: Result<()>) {
        self.step_responses.lock().await.push_back(response);
    }

    pub async fn push_one_shot_response(&self, response: Result<bool>) {
        self.one_shot_responses.lock().await.push_back(response);
    }

    pub async fn sent(&self) -> Vec<Sent> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send_sequenced_message(
        &self,
        user: &User,
        step: &StepDefinition,
        message: &RenderedMessage,
    ) -> Result<()> {
        let response = self.step_responses.lock().await.pop_front().unwrap_or(Ok(()));
        if response.is_ok() {
            self.sent.lock().await.push(Sent::Step {
                user_id: user.id,
                label: step.label.to_string(),
                subject: message.subject.clone(),
            });
        }
        response
    }

    async fn send_one_shot_message(
        &self,
        user: &User,
        notification: &OutboxNotification,
        message: &RenderedMessage,
    ) -> Result<bool> {
        let response = self
            .one_shot_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(true));
        if matches!(response, Ok(true)) {
            self.sent.lock().await.push(Sent::OneShot {
                user_id: user.id,
                kind: notification.kind.clone(),
                subject: message.subject.clone(),
            });
        }
        response
    }
}
