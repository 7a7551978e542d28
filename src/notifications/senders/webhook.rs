use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::{SenderError, WebhookSender};

/// Plain GET webhooks. Only a 200 counts as delivered; anything else is
/// re-issued immediately until `attempts` runs out.
pub struct HttpWebhookSender {
    client: Client,
    attempts: u32,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration, attempts: u32) -> Result<Self, SenderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            attempts: attempts.max(1),
        })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn trigger(&self, url: &str) -> Result<(), SenderError> {
        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            match self.client.get(url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    debug!(url, attempt, "Webhook triggered");
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("non-200 status {}", response.status());
                    warn!(url, attempt, status = %response.status(), "Webhook got non-200 status, retrying");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(url, attempt, error = %e, "Webhook request failed, retrying");
                }
            }
        }
        Err(SenderError::SendFailed(format!(
            "webhook {url} failed after {} attempts: {last_error}",
            self.attempts
        )))
    }
}
