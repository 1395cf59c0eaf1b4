//! Message templates for campaign steps and one-shot notifications.
//!
//! Templates use `{{name}}` placeholders filled from the user snapshot and the
//! job metadata (or notification data). Unknown placeholders render empty.

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::{OutboxNotification, User};
use crate::steps::StepDefinition;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([a-zA-Z0-9_]+)\s*\}\}").expect("valid placeholder regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub template: String,
    pub subject: String,
    pub body: String,
}

struct Template {
    id: &'static str,
    subject: &'static str,
    body: &'static str,
}

const STEP_TEMPLATES: &[Template] = &[
    Template {
        id: "connect_welcome",
        subject: "Welcome, {{name}}! Connect Strava to get started",
        body: "Hi {{name}},\n\nConnect your Strava account and your first training insights will be ready within minutes.",
    },
    Template {
        id: "connect_benefits",
        subject: "What your runs are telling you",
        body: "Hi {{name}},\n\nOnce connected we analyse every activity: recovery, efficiency and data quality, all in one place.",
    },
    Template {
        id: "connect_last_call",
        subject: "Still want smarter training, {{name}}?",
        body: "Hi {{name}},\n\nThis is our last reminder. Connecting takes less than a minute.",
    },
    Template {
        id: "trial_first_insights",
        subject: "Your first insights are in",
        body: "Hi {{name}},\n\nYour trial is running. Open the app to see what your recent activities reveal.",
    },
    Template {
        id: "trial_feature_tour",
        subject: "Three features worth trying this week",
        body: "Hi {{name}},\n\nHave you tried recovery scoring, efficiency trends and AI coaching notes yet?",
    },
    Template {
        id: "trial_ending_soon",
        subject: "Your trial ends soon",
        body: "Hi {{name}},\n\nKeep your coaching history and insights by upgrading before your trial ends.",
    },
    Template {
        id: "winback_checkin",
        subject: "We miss you, {{name}}",
        body: "Hi {{name}},\n\nIt has been a while. Your training history is waiting for you.",
    },
    Template {
        id: "winback_progress",
        subject: "See how far you've come",
        body: "Hi {{name}},\n\nLog back in to compare your recent activities with your best weeks.",
    },
    Template {
        id: "winback_offer",
        subject: "A little something to get you moving again",
        body: "Hi {{name}},\n\nCome back this week and pick up where you left off. {{offer}}",
    },
];

const NOTIFICATION_TEMPLATES: &[Template] = &[
    Template {
        id: "payment_failed",
        subject: "Action needed: payment failed",
        body: "Hi {{name}},\n\nWe could not process your payment of {{amount}}. Please update your billing details.",
    },
    Template {
        id: "weekly_summary",
        subject: "Your week in training",
        body: "Hi {{name}},\n\nYou logged {{activities}} activities this week. {{body}}",
    },
    Template {
        id: "subscription_confirmed",
        subject: "Thanks for subscribing, {{name}}",
        body: "Hi {{name}},\n\nYour subscription is active. {{body}}",
    },
];

fn find(templates: &'static [Template], id: &str) -> Option<&'static Template> {
    templates.iter().find(|t| t.id == id)
}

/// Replace `{{key}}` placeholders with values from `vars`.
pub fn substitute(text: &str, vars: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| match vars.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

fn base_vars(user: &User, extra: &Value) -> Map<String, Value> {
    let mut vars = Map::new();
    let name = user
        .display_name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or("there");
    vars.insert("name".into(), Value::String(name.to_string()));
    if let Some(email) = user.contact_address() {
        vars.insert("email".into(), Value::String(email.to_string()));
    }
    if let Value::Object(extra) = extra {
        for (k, v) in extra {
            vars.insert(k.clone(), v.clone());
        }
    }
    vars
}

/// Render a campaign step for `user` with the job's metadata as parameters.
pub fn render_step(step: &StepDefinition, user: &User, params: &Value) -> Result<RenderedMessage> {
    let template = find(STEP_TEMPLATES, step.template)
        .ok_or_else(|| anyhow!("no template registered for step {}", step.template))?;
    let vars = base_vars(user, params);
    Ok(RenderedMessage {
        template: template.id.to_string(),
        subject: substitute(template.subject, &vars),
        body: substitute(template.body, &vars),
    })
}

/// Render a one-shot notification. Types without a dedicated template use the
/// notification's own title and body.
pub fn render_notification(notification: &OutboxNotification, user: &User) -> RenderedMessage {
    let mut vars = base_vars(user, &notification.data);
    vars.insert("title".into(), Value::String(notification.title.clone()));
    vars.insert("body".into(), Value::String(notification.body.clone()));
    match find(NOTIFICATION_TEMPLATES, &notification.kind) {
        Some(template) => RenderedMessage {
            template: template.id.to_string(),
            subject: substitute(template.subject, &vars),
            body: substitute(template.body, &vars),
        },
        None => RenderedMessage {
            template: notification.kind.clone(),
            subject: substitute(&notification.title, &vars),
            body: substitute(&notification.body, &vars),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NotificationStatus, Segment};
    use crate::steps::steps_for;
    use chrono::Utc;
    use serde_json::json;

    fn user() -> User {
        let mut user = User::new(3, Some("kim@example.com"), Utc::now());
        user.display_name = Some("Kim".into());
        user
    }

    fn notification(kind: &str, data: Value) -> OutboxNotification {
        OutboxNotification {
            id: 1,
            user_id: 3,
            kind: kind.into(),
            channel: "email".into(),
            title: "Hello {{name}}".into(),
            body: "Plain body".into(),
            data,
            dedupe_key: "k".into(),
            status: NotificationStatus::Pending,
            reason: None,
            scheduled_at: Utc::now(),
            sent_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn every_catalog_step_has_a_template() {
        for segment in Segment::ALL {
            for step in steps_for(segment) {
                render_step(step, &user(), &Value::Null).unwrap();
            }
        }
    }

    #[test]
    fn step_params_fill_placeholders() {
        let step = steps_for(Segment::Lapsed).last().unwrap();
        let msg = render_step(step, &user(), &json!({"offer": "20% off"})).unwrap();
        assert_eq!(msg.template, "winback_offer");
        assert!(msg.body.starts_with("Hi Kim,"));
        assert!(msg.body.ends_with("20% off"));
    }

    #[test]
    fn missing_name_and_params_render_gracefully() {
        let step = steps_for(Segment::Lapsed).last().unwrap();
        let anonymous = User::new(4, None, Utc::now());
        let msg = render_step(step, &anonymous, &Value::Null).unwrap();
        assert!(msg.body.starts_with("Hi there,"));
        assert!(!msg.body.contains("{{"));
    }

    #[test]
    fn known_notification_types_use_their_template() {
        let msg = render_notification(
            &notification("payment_failed", json!({"amount": "$9.99"})),
            &user(),
        );
        assert_eq!(msg.subject, "Action needed: payment failed");
        assert!(msg.body.contains("$9.99"));
        let msg = render_notification(&notification("weekly_summary", json!({"activities": 4})), &user());
        assert!(msg.body.contains("You logged 4 activities"));
    }

    #[test]
    fn unknown_notification_types_fall_back_to_title_and_body() {
        let msg = render_notification(&notification("announcement", Value::Null), &user());
        assert_eq!(msg.template, "announcement");
        assert_eq!(msg.subject, "Hello Kim");
        assert_eq!(msg.body, "Plain body");
    }
}
