use async_trait::async_trait;
use thiserror::Error;

pub mod email;
pub mod webhook;

pub use email::MailjetSender;
pub use webhook::HttpWebhookSender;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// Delivers one message to many recipients in a single provider call.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_batch(
        &self,
        recipients: &[String],
        subject: &str,
        text: &str,
    ) -> Result<(), SenderError>;
}

/// Fires a webhook. Implementations own their retry policy.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn trigger(&self, url: &str) -> Result<(), SenderError>;
}
