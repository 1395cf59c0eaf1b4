use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::TransportConfig;
use crate::model::{OutboxNotification, User};
use crate::steps::StepDefinition;
use crate::templates::RenderedMessage;

/// Permanent refusal of a message by the provider.
#[derive(Debug, Error)]
#[error("message rejected: {0}")]
pub struct Rejected(pub String);

/// Outbound delivery of rendered messages.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver one campaign step. Any error counts as a failed dispatch; a
    /// [`Rejected`] error fails the job without retry.
    async fn send_sequenced_message(
        &self,
        user: &User,
        step: &StepDefinition,
        message: &RenderedMessage,
    ) -> Result<()>;

    /// Deliver a one-shot notification. `Ok(false)` means the provider
    /// rejected the message permanently.
    async fn send_one_shot_message(
        &self,
        user: &User,
        notification: &OutboxNotification,
        message: &RenderedMessage,
    ) -> Result<bool>;
}

/// JSON email API client (`POST <endpoint>` with a bearer token).
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    endpoint: Url,
    api_key: String,
    from: String,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn from_config(cfg: &TransportConfig) -> Result<Self> {
        let endpoint = Url::parse(&cfg.endpoint)
            .with_context(|| format!("invalid transport endpoint {}", cfg.endpoint))?;
        let http = Client::builder()
            .user_agent(concat!("lifecycle-mailer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            api_key: cfg.api_key.clone(),
            from: cfg.from.clone(),
        })
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request> {
        self.http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(body)
            .build()
            .context("failed to build email request")
    }

    async fn post(&self, body: Value) -> Result<StatusCode> {
        let request = self.build_request(&body)?;
        let resp = self
            .http
            .execute(request)
            .await
            .context("email API request failed")?;
        let status = resp.status();
        if status.is_success() {
            return Ok(status);
        }
        let text = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            info!(%status, body = %text, "email API rejected message");
            return Ok(status);
        }
        Err(anyhow!("email API returned {}: {}", status, text))
    }
}

/// Request body understood by the email API.
pub fn build_email_payload(
    from: &str,
    to: &str,
    message: &RenderedMessage,
    tags: &[(&str, String)],
) -> Value {
    let tags: Vec<Value> = tags
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    json!({
        "from": from,
        "to": [to],
        "subject": message.subject,
        "text": message.body,
        "template": message.template,
        "tags": tags,
    })
}

#[async_trait]
impl MessageTransport for HttpTransport {
    #[instrument(skip_all, fields(user_id = user.id, step = step.label))]
    async fn send_sequenced_message(
        &self,
        user: &User,
        step: &StepDefinition,
        message: &RenderedMessage,
    ) -> Result<()> {
        let to = user
            .contact_address()
            .ok_or_else(|| anyhow!("user {} has no contact address", user.id))?;
        let body = build_email_payload(
            &self.from,
            to,
            message,
            &[
                ("segment", step.segment.as_str().to_string()),
                ("step", step.label.to_string()),
            ],
        );
        let status = self.post(body).await?;
        if !status.is_success() {
            return Err(Rejected(format!("step {}: {}", step.label, status)).into());
        }
        Ok(())
    }

    #[instrument(skip_all, fields(user_id = user.id, kind = %notification.kind))]
    async fn send_one_shot_message(
        &self,
        user: &User,
        notification: &OutboxNotification,
        message: &RenderedMessage,
    ) -> Result<bool> {
        let Some(to) = user.contact_address() else {
            return Ok(false);
        };
        let body = build_email_payload(
            &self.from,
            to,
            message,
            &[("notification", notification.kind.clone())],
        );
        Ok(self.post(body).await?.is_success())
    }
}

/// Dry-run transport: logs what would be sent and reports success.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl MessageTransport for LogTransport {
    async fn send_sequenced_message(
        &self,
        user: &User,
        step: &StepDefinition,
        message: &RenderedMessage,
    ) -> Result<()> {
        info!(
            user_id = user.id,
            segment = %step.segment,
            step = step.label,
            subject = %message.subject,
            "dry run: campaign email"
        );
        Ok(())
    }

    async fn send_one_shot_message(
        &self,
        user: &User,
        notification: &OutboxNotification,
        message: &RenderedMessage,
    ) -> Result<bool> {
        info!(
            user_id = user.id,
            kind = %notification.kind,
            subject = %message.subject,
            "dry run: notification email"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig {
            endpoint: "https://mail.example.test/v1/send".into(),
            api_key: "secret".into(),
            from: "Coach <coach@example.test>".into(),
            dry_run: false,
        }
    }

    fn message() -> RenderedMessage {
        RenderedMessage {
            template: "winback_checkin".into(),
            subject: "We miss you".into(),
            body: "Hi".into(),
        }
    }

    #[test]
    fn payload_includes_recipient_and_tags() {
        let body = build_email_payload(
            "from@example.test",
            "to@example.test",
            &message(),
            &[("step", "lapsed-1".into())],
        );
        assert_eq!(body["to"], json!(["to@example.test"]));
        assert_eq!(body["subject"], "We miss you");
        assert_eq!(body["template"], "winback_checkin");
        assert_eq!(body["tags"][0]["name"], "step");
        assert_eq!(body["tags"][0]["value"], "lapsed-1");
    }

    #[test]
    fn build_request_sets_auth_and_endpoint() {
        let transport = HttpTransport::from_config(&config()).unwrap();
        let req = transport.build_request(&json!({"a": 1})).unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "https://mail.example.test/v1/send");
        assert_eq!(
            req.headers().get("authorization").unwrap(),
            "Bearer secret"
        );
        assert_eq!(
            req.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn debug_hides_api_key() {
        let transport = HttpTransport::from_config(&config()).unwrap();
        assert!(!format!("{:?}", transport).contains("secret"));
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let mut cfg = config();
        cfg.endpoint = "not a url".into();
        assert!(HttpTransport::from_config(&cfg).is_err());
    }
}
