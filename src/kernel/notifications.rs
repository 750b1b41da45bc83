//! Notification fan-out (C9, spec.md §4.9): Telegram/email/webhook delivery
//! triggered by C5/C6/C7/C8 lifecycle events. Email/Telegram transport and
//! full i18n are out of scope (spec.md §1); this module owns the dispatch,
//! template-selection, and webhook-signing logic around them.

use std::collections::HashMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationEvent {
    Success,
    Failure,
    Recovery,
    MissedStart,
    MissedEnd,
}

impl NotificationEvent {
    fn as_str(self) -> &'static str {
        match self {
            NotificationEvent::Success => "success",
            NotificationEvent::Failure => "failure",
            NotificationEvent::Recovery => "recovery",
            NotificationEvent::MissedStart => "missed_start",
            NotificationEvent::MissedEnd => "missed_end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Telegram,
    Email,
    Webhook,
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub channel: Channel,
    pub address: String,
    /// BCP-47-ish language tag, e.g. "en", "ru". Falls back to English when
    /// no template exists for it.
    pub language: String,
}

/// Everything a template needs to render: the entity's name plus
/// protocol/monitor-specific details.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationContext {
    pub entity_name: String,
    pub details: serde_json::Value,
}

/// Per-recipient-language templates with a two-tier (language, then English)
/// lookup, the behavior `original_source`'s template service implements
/// (SPEC_FULL §B "Notification channel language fallback").
pub struct NotificationTemplate;

impl NotificationTemplate {
    /// Returns `(subject, body)`.
    pub fn render(event: NotificationEvent, language: &str, ctx: &NotificationContext) -> (String, String) {
        let table = Self::templates();
        let (subject_template, body_template) = table
            .get(&(event, language))
            .or_else(|| table.get(&(event, "en")))
            .expect("English templates are defined for every event");
        (
            subject_template.replace("{name}", &ctx.entity_name),
            body_template.replace("{name}", &ctx.entity_name),
        )
    }

    fn templates() -> HashMap<(NotificationEvent, &'static str), (&'static str, &'static str)> {
        use NotificationEvent::*;
        let mut m = HashMap::new();
        m.insert((Success, "en"), ("CronBox: {name} succeeded", "{name} completed successfully."));
        m.insert((Failure, "en"), ("CronBox: {name} failed", "{name} failed."));
        m.insert((Recovery, "en"), ("CronBox: {name} recovered", "{name} is healthy again."));
        m.insert((MissedStart, "en"), ("CronBox: {name} missed start", "{name} did not start on time."));
        m.insert((MissedEnd, "en"), ("CronBox: {name} missed end", "{name} did not finish in time."));
        m.insert((Success, "ru"), ("CronBox: {name} выполнено", "{name} успешно завершено."));
        m.insert((Failure, "ru"), ("CronBox: {name} ошибка", "{name} завершилось с ошибкой."));
        m
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    data: &'a serde_json::Value,
    timestamp: i64,
}

/// HMAC-SHA256-sign the webhook body and return the hex-encoded signature to
/// send as `X-Webhook-Secret` (SPEC_FULL §B, adapted from
/// `sblanchard-SerialAgent`'s inbound webhook verification for outbound use).
fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification, exposed for symmetry with the signing side
/// and for webhook-receiver test harnesses.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let expected = sign_payload(secret, body);
    let expected_bytes = expected.as_bytes();
    let actual_bytes = signature_hex.as_bytes();
    expected_bytes.len() == actual_bytes.len() && expected_bytes.ct_eq(actual_bytes).into()
}

async fn send_webhook(
    client: &reqwest::Client,
    url: &str,
    secret: Option<&str>,
    event: NotificationEvent,
    details: &serde_json::Value,
    timeout: Duration,
    now_unix: i64,
) {
    let payload = WebhookPayload {
        event: event.as_str(),
        data: details,
        timestamp: now_unix,
    };
    let body = match serde_json::to_vec(&payload) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to serialize webhook payload");
            return;
        }
    };

    let mut request = client.post(url).timeout(timeout).header("content-type", "application/json");
    if let Some(secret) = secret {
        request = request.header("X-Webhook-Secret", sign_payload(secret, &body));
    }

    if let Err(e) = request.body(body).send().await {
        let redacted = url::Url::parse(url)
            .map(|u| crate::kernel::probes::ssrf::redact_url(&u))
            .unwrap_or_else(|_| "<unparseable>".to_string());
        warn!(error = %e, url = %redacted, "webhook delivery failed");
    }
}

async fn send_telegram(client: &reqwest::Client, bot_token: &str, chat_id: &str, text: &str) {
    let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
    let body = serde_json::json!({ "chat_id": chat_id, "text": text });
    if let Err(e) = client.post(&url).json(&body).send().await {
        warn!(error = %e, "telegram delivery failed");
    }
}

async fn send_email(client: &reqwest::Client, email_api_url: &str, to: &str, subject: &str, body_text: &str) {
    let payload = serde_json::json!({ "to": to, "subject": subject, "text": body_text });
    if let Err(e) = client.post(email_api_url).json(&payload).send().await {
        warn!(error = %e, "email delivery failed");
    }
}

/// Configuration for the channels C9 fans out to. Addresses/credentials come
/// from workspace settings (admin CRUD, out of scope here per spec.md §1).
pub struct ChannelConfig<'a> {
    pub telegram_bot_token: Option<&'a str>,
    pub email_api_url: Option<&'a str>,
    pub webhook_timeout: Duration,
}

/// Fans an event out to every recipient in parallel. One channel's delivery
/// failure never blocks another's, and webhook failures are logged and
/// swallowed (spec.md §4.9, §7).
pub async fn dispatch(
    client: &reqwest::Client,
    recipients: &[Recipient],
    event: NotificationEvent,
    ctx: &NotificationContext,
    channels: &ChannelConfig<'_>,
    webhook_secrets: &HashMap<String, String>,
    now_unix: i64,
) {
    let sends = recipients.iter().map(|recipient| {
        let (subject, body) = NotificationTemplate::render(event, &recipient.language, ctx);
        async move {
            match recipient.channel {
                Channel::Telegram => {
                    if let Some(token) = channels.telegram_bot_token {
                        send_telegram(client, token, &recipient.address, &body).await;
                    }
                }
                Channel::Email => {
                    if let Some(api_url) = channels.email_api_url {
                        send_email(client, api_url, &recipient.address, &subject, &body).await;
                    }
                }
                Channel::Webhook => {
                    let secret = webhook_secrets.get(&recipient.address).map(String::as_str);
                    send_webhook(
                        client,
                        &recipient.address,
                        secret,
                        event,
                        &ctx.details,
                        channels.webhook_timeout,
                        now_unix,
                    )
                    .await;
                }
            }
        }
    });

    futures::future::join_all(sends).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_falls_back_to_english() {
        let ctx = NotificationContext {
            entity_name: "nightly-backup".to_string(),
            details: serde_json::json!({}),
        };
        let (subject, _) = NotificationTemplate::render(NotificationEvent::MissedStart, "fr", &ctx);
        assert!(subject.contains("nightly-backup"));
    }

    #[test]
    fn template_uses_language_when_available() {
        let ctx = NotificationContext {
            entity_name: "job".to_string(),
            details: serde_json::json!({}),
        };
        let (subject, _) = NotificationTemplate::render(NotificationEvent::Failure, "ru", &ctx);
        assert!(subject.contains("ошибка"));
    }

    #[test]
    fn signature_round_trips() {
        let secret = "wh_secret";
        let body = b"{\"event\":\"failure\"}";
        let sig = sign_payload(secret, body);
        assert!(verify_signature(secret, body, &sig));
        assert!(!verify_signature(secret, body, "deadbeef"));
    }
}
