//! Notification channels
//!
//! Approval requests fan out to webhook, email, slack and teams channels.
//! Every channel failure is logged and swallowed: notification is a
//! peripheral side effect and never fails the step that triggered it.

use chrono::SecondsFormat;
use flowpilot_core::config::EngineSettings;
use flowpilot_core::step::{ChannelKind, NotificationChannelSpec};
use flowpilot_core::types::ApprovalRequest;
use log::{debug, warn};
use serde_json::{json, Value};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// Sends approval notifications over the configured channels
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    app_base_url: Option<String>,
    resend_api_key: Option<String>,
}

impl Notifier {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            app_base_url: settings.app_base_url.clone(),
            resend_api_key: settings.resend_api_key.clone(),
        }
    }

    /// The JSON envelope posted to webhook-style channels
    pub fn approval_envelope(&self, request: &ApprovalRequest) -> Value {
        json!({
            "type": "approval_request",
            "approval_id": request.approval_id,
            "execution_id": request.execution_id,
            "step_id": request.step_id,
            "title": request.title,
            "message": request.message,
            "context": request.context,
            "approvers": request.approvers,
            "approval_type": request.approval_type,
            "expires_at": request.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "created_at": request.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }

    fn approval_link(&self, request: &ApprovalRequest) -> Option<String> {
        self.app_base_url
            .as_ref()
            .map(|base| format!("{}/approvals/{}", base.trim_end_matches('/'), request.approval_id))
    }

    /// Notify every configured channel; failures are logged only
    pub async fn notify_all(&self, channels: &[NotificationChannelSpec], request: &ApprovalRequest) {
        for channel in channels {
            if let Err(e) = self.notify(channel, request).await {
                warn!(
                    "notification via {} failed for approval {}: {}",
                    channel.channel, request.approval_id, e
                );
            }
        }
    }

    async fn notify(
        &self,
        channel: &NotificationChannelSpec,
        request: &ApprovalRequest,
    ) -> anyhow::Result<()> {
        match channel.channel {
            ChannelKind::Webhook => {
                let url = channel
                    .config
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("webhook channel is missing config.url"))?;
                let mut builder = self.client.post(url).json(&self.approval_envelope(request));
                if let Some(token) = channel.config.get("auth_token").and_then(Value::as_str) {
                    builder = builder.bearer_auth(token);
                }
                let response = builder.send().await?;
                debug!("webhook notification -> {} ({})", url, response.status());
                response.error_for_status()?;
            }
            ChannelKind::Email => {
                let api_key = self
                    .resend_api_key
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("email channel needs RESEND_API_KEY"))?;
                let from = channel
                    .config
                    .get("from")
                    .and_then(Value::as_str)
                    .unwrap_or("approvals@flowpilot.dev");
                let mut body_text = request
                    .message
                    .clone()
                    .unwrap_or_else(|| request.title.clone());
                if let Some(link) = self.approval_link(request) {
                    body_text.push_str(&format!("\n\nReview: {}", link));
                }
                let response = self
                    .client
                    .post(RESEND_ENDPOINT)
                    .bearer_auth(api_key)
                    .json(&json!({
                        "from": from,
                        "to": request.approvers,
                        "subject": format!("Approval requested: {}", request.title),
                        "text": body_text,
                    }))
                    .send()
                    .await?;
                response.error_for_status()?;
            }
            ChannelKind::Slack => {
                let url = channel
                    .config
                    .get("webhook_url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("slack channel is missing config.webhook_url"))?;
                let mut text = format!("*Approval requested:* {}", request.title);
                if let Some(message) = &request.message {
                    text.push_str(&format!("\n{}", message));
                }
                if let Some(link) = self.approval_link(request) {
                    text.push_str(&format!("\n<{}|Review request>", link));
                }
                let response = self.client.post(url).json(&json!({ "text": text })).send().await?;
                response.error_for_status()?;
            }
            ChannelKind::Teams => {
                let url = channel
                    .config
                    .get("webhook_url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("teams channel is missing config.webhook_url"))?;
                let mut text = format!("**Approval requested:** {}", request.title);
                if let Some(message) = &request.message {
                    text.push_str(&format!("\n\n{}", message));
                }
                if let Some(link) = self.approval_link(request) {
                    text.push_str(&format!("\n\n[Review request]({})", link));
                }
                let response = self
                    .client
                    .post(url)
                    .json(&json!({"@type": "MessageCard", "text": text}))
                    .send()
                    .await?;
                response.error_for_status()?;
            }
        }
        Ok(())
    }
}
