//! Push notification fan-out.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BarkConfig, Config};

const BARK_TIMEOUT: Duration = Duration::from_secs(5);

/// A message for one new post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub url: String,
}

/// A delivery channel. `send` reports success and never fails loudly.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> bool;
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn send(&self, notification: &Notification) -> bool {
        info!(
            title = %notification.title,
            url = %notification.url,
            "{}",
            notification.body
        );
        true
    }
}

/// Sends pushes through a Bark server.
pub struct BarkNotifier {
    client: Client,
    endpoint: Url,
    group: String,
    sound: String,
}

#[derive(Serialize)]
struct BarkRequest<'a> {
    title: &'a str,
    body: &'a str,
    url: &'a str,
    group: &'a str,
    sound: &'a str,
}

impl BarkNotifier {
    /// # Errors
    ///
    /// Returns an error if the server URL or device key do not form a valid URL.
    pub fn new(config: &BarkConfig) -> Result<Self> {
        let mut base = Url::parse(&config.server_url)
            .with_context(|| format!("Invalid Bark server URL: {}", config.server_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(&config.device_key)
            .context("Invalid Bark device key")?;

        let client = Client::builder()
            .timeout(BARK_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            group: config.group.clone(),
            sound: config.sound.clone(),
        })
    }
}

#[async_trait]
impl Notifier for BarkNotifier {
    fn name(&self) -> &'static str {
        "bark"
    }

    async fn send(&self, notification: &Notification) -> bool {
        let request = BarkRequest {
            title: &notification.title,
            body: &notification.body,
            url: &notification.url,
            group: &self.group,
            sound: &self.sound,
        };

        let response = match self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Bark request failed");
                return false;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Bark returned an error status");
            return false;
        }

        // Bark answers {"code": 200, ...}; a missing or unparsable body counts as accepted.
        match response.json::<serde_json::Value>().await {
            Ok(body) => match body.get("code").and_then(serde_json::Value::as_i64) {
                Some(200) | None => true,
                Some(code) => {
                    warn!(code, "Bark rejected notification");
                    false
                }
            },
            Err(_) => true,
        }
    }
}

/// Sends each notification to every registered channel.
#[derive(Default)]
pub struct NotificationDispatcher {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Register the channels enabled in configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an enabled channel is misconfigured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
        if config.console_notification_enabled {
            notifiers.push(Box::new(ConsoleNotifier));
        }
        if let Some(bark) = &config.bark {
            notifiers.push(Box::new(BarkNotifier::new(bark)?));
        }
        info!(
            channels = ?notifiers.iter().map(|n| n.name()).collect::<Vec<_>>(),
            "Notification channels ready"
        );
        Ok(Self { notifiers })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Returns how many channels accepted the notification.
    pub async fn send(&self, notification: &Notification) -> usize {
        let mut delivered = 0;
        for notifier in &self.notifiers {
            if notifier.send(notification).await {
                delivered += 1;
            } else {
                debug!(channel = notifier.name(), "Notification not delivered");
            }
        }
        delivered
    }
}
