//! Operator notifications
//!
//! Fire-and-forget messages about triggers, swaps and failures. A failed
//! notification is logged and never affects trading.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Send `message` on a background task, logging instead of propagating any failure.
///
/// The caller never waits on the notifier; await the handle only where the
/// message must be out before going on (e.g. at shutdown).
pub fn notify_quietly(notifier: &Arc<dyn Notifier>, message: impl Into<String>) -> JoinHandle<()> {
    let notifier = Arc::clone(notifier);
    let message = message.into();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&message).await {
            warn!(error = %e, "Failed to send notification");
        }
    })
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Telegram Bot API notifier
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_url: TELEGRAM_API_URL.to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
        })
    }

    /// Point at a different Bot API host
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_url, self.token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: message,
        };

        let response = self
            .client
            .post(self.send_message_url())
            .json(&body)
            .send()
            .await
            .context("Failed to send Telegram message")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("Failed to send Telegram message: {} - {}", status, text);
        }

        Ok(())
    }
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        info!(notification = %message, "Notification");
        Ok(())
    }
}
