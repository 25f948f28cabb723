use crate::{
    domain::Notifier,
    errors::NotifyError,
    models::{Meme, RejectReason},
};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_sns::Client as SnsClient;
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

/// Upper bound on subject length, in characters.
pub const MAX_SUBJECT_CHARS: usize = 100;
const SUBJECT_PREFIX: &str = "[Meme Museum]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Register,
    UploadApproved,
    UploadRejected,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Register => "register",
            NotificationKind::UploadApproved => "upload-approved",
            NotificationKind::UploadRejected => "upload-rejected",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "register" => Ok(NotificationKind::Register),
            "upload-approved" => Ok(NotificationKind::UploadApproved),
            "upload-rejected" => Ok(NotificationKind::UploadRejected),
            other => Err(format!("unknown notification kind '{}'", other)),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static routing used when nothing is configured.
pub fn default_channels() -> HashMap<NotificationKind, String> {
    HashMap::from([
        (NotificationKind::Register, "admin-channel".to_string()),
        (NotificationKind::UploadApproved, "admin-channel".to_string()),
        (NotificationKind::UploadRejected, "moderation-channel".to_string()),
    ])
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn registered(email: &str, at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            kind: NotificationKind::Register,
            subject: format!("{} New user registered: {}", SUBJECT_PREFIX, email),
            body: format!("User {} registered at {}", email, at.to_rfc3339()),
        }
    }

    pub fn upload_approved(meme: &Meme) -> Self {
        Self {
            kind: NotificationKind::UploadApproved,
            subject: format!("{} Meme approved: {}", SUBJECT_PREFIX, meme.meme_id),
            body: format!(
                "Meme '{}' by {} was approved.\nMeme ID: {}",
                meme.title, meme.owner, meme.meme_id
            ),
        }
    }

    pub fn upload_rejected(meme: &Meme) -> Self {
        Self {
            kind: NotificationKind::UploadRejected,
            subject: format!("{} Meme rejected: {}", SUBJECT_PREFIX, meme.meme_id),
            body: format!(
                "Meme '{}' by {} was rejected.\nReasons: {}",
                meme.title,
                meme.owner,
                format_reasons(&meme.reject_reasons)
            ),
        }
    }
}

fn format_reasons(reasons: &[RejectReason]) -> String {
    reasons
        .iter()
        .map(|r| format!("{} ({:.1}%)", r.label, r.confidence))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cuts `subject` to `MAX_SUBJECT_CHARS` on a character boundary.
pub fn truncate_subject(subject: &str) -> &str {
    match subject.char_indices().nth(MAX_SUBJECT_CHARS) {
        Some((byte_index, _)) => &subject[..byte_index],
        None => subject,
    }
}

/// Picks a channel per notification kind and publishes through a `Notifier`.
/// Never returns an error: transport failures are logged and dropped.
#[derive(Clone)]
pub struct NotificationRouter {
    notifier: Arc<dyn Notifier>,
    channels: HashMap<NotificationKind, String>,
}

impl NotificationRouter {
    pub fn new(notifier: Arc<dyn Notifier>, channels: HashMap<NotificationKind, String>) -> Self {
        Self { notifier, channels }
    }

    pub fn channel_for(&self, kind: NotificationKind) -> Option<&str> {
        self.channels.get(&kind).map(String::as_str).filter(|c| !c.is_empty())
    }

    pub async fn publish(&self, notification: &Notification) {
        let Some(channel) = self.channel_for(notification.kind) else {
            tracing::debug!(kind = %notification.kind, "No channel routed for notification, skipping");
            return;
        };
        let subject = truncate_subject(&notification.subject);
        match self.notifier.publish(channel, subject, &notification.body).await {
            Ok(()) => tracing::debug!(kind = %notification.kind, channel, "Notification published"),
            Err(e) => tracing::warn!(kind = %notification.kind, channel, error = %e, "Notification publish failed"),
        }
    }
}

/// Writes notifications to the log. Used for local runs.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, channel: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        tracing::info!(channel, subject, body, "Notification");
        Ok(())
    }
}

/// Publishes to SNS topics; the channel id is the topic ARN.
#[derive(Debug, Clone)]
pub struct SnsNotifier {
    client: SnsClient,
}

impl SnsNotifier {
    pub fn new(client: SnsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for SnsNotifier {
    async fn publish(&self, channel: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        self.client
            .publish()
            .topic_arn(channel)
            .subject(subject)
            .message(body)
            .send()
            .await
            .context(format!("SNS: Failed to publish to topic '{}'", channel))?;
        Ok(())
    }
}
