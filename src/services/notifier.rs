//! Best-effort status notifications.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::NotifyConfig;
use crate::utils::{http, truncate_graphemes, url};

/// Longest message body sent, in grapheme clusters.
pub const MAX_MESSAGE_GRAPHEMES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Fire-and-forget side channel. Implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str, severity: Severity);
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, title: &str, _message: &str, severity: Severity) {
        log::debug!("Notification ({severity}) not sent, no endpoint: {title}");
    }
}

/// Bark-style push: `GET {base}/{title}/{message}`.
#[derive(Debug, Clone)]
pub struct BarkNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl BarkNotifier {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: http::create_short_client("pilgrim-notify", timeout_secs)?,
            base_url: base_url.into(),
        })
    }

    async fn send(&self, title: &str, message: &str) -> Result<()> {
        let message = truncate_graphemes(message, MAX_MESSAGE_GRAPHEMES);
        let target = url::join_segments(&self.base_url, &[title, &message])?;
        self.client
            .get(target)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for BarkNotifier {
    async fn notify(&self, title: &str, message: &str, severity: Severity) {
        match self.send(title, message).await {
            Ok(()) => log::info!("Notification sent ({severity}): {title}"),
            Err(e) => log::warn!(
                "Notification failed for {}: {}",
                url::redact(&self.base_url),
                e
            ),
        }
    }
}

/// Pick the notifier for a config: Bark when a URL is set, otherwise no-op.
pub fn from_config(config: &NotifyConfig) -> Box<dyn Notifier> {
    match config.url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(base) => match BarkNotifier::new(base, config.timeout_secs) {
            Ok(notifier) => Box::new(notifier),
            Err(e) => {
                log::warn!("Notifications disabled: {e}");
                Box::new(NoopNotifier)
            }
        },
        None => Box::new(NoopNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_is_swallowed() {
        // Port 9 on loopback is closed; the call must return without panicking.
        let notifier = BarkNotifier::new("http://127.0.0.1:9/KEY", 1).unwrap();
        notifier
            .notify("Scan", "completed", Severity::Info)
            .await;
    }

    #[tokio::test]
    async fn invalid_base_url_is_swallowed() {
        let notifier = BarkNotifier::new("not a url", 1).unwrap();
        notifier.notify("Scan", "failed", Severity::Error).await;
    }
}
