use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{error, info, warn};

use super::models::Notification;
use super::senders::{EmailSender, WebhookSender};
use crate::queue::DeliveryHandler;

/// Turns queued notifications into emails and webhook calls.
pub struct Notifier {
    email: Arc<dyn EmailSender>,
    webhooks: Arc<dyn WebhookSender>,
}

impl Notifier {
    pub fn new(email: Arc<dyn EmailSender>, webhooks: Arc<dyn WebhookSender>) -> Self {
        Self { email, webhooks }
    }

    /// Returns `false` only when the payload cannot be parsed, which asks the
    /// queue to requeue it. Once parsed the message is acknowledged even if
    /// every delivery fails; failures are only logged.
    pub async fn handle(&self, message_id: &str, payload: &[u8]) -> bool {
        let notification: Notification = match serde_json::from_slice(payload) {
            Ok(n) => n,
            Err(e) => {
                error!(message_id, error = %e, "Failed to parse notification payload");
                return false;
            }
        };

        info!(
            message_id,
            check_name = %notification.check_name,
            flip_to = %notification.flip_to,
            channels = notification.channels.len(),
            "Processing notification"
        );

        let emails = notification.emails();
        let webhooks = notification.webhooks();

        let email_task = async {
            if emails.is_empty() {
                return;
            }
            let subject = notification.subject();
            let text = notification.text();
            match self.email.send_batch(&emails, &subject, &text).await {
                Ok(()) => info!(message_id, recipients = emails.len(), "Email batch sent"),
                Err(e) => warn!(message_id, error = %e, "Email batch failed"),
            }
        };

        let webhook_tasks = webhooks.iter().map(move |url| async move {
            if let Err(e) = self.webhooks.trigger(url).await {
                warn!(message_id, url = %url, error = %e, "Webhook delivery failed");
            }
        });

        tokio::join!(email_task, join_all(webhook_tasks));
        true
    }
}

#[async_trait]
impl DeliveryHandler for Notifier {
    async fn handle(&self, message_id: &str, payload: &[u8]) -> bool {
        Notifier::handle(self, message_id, payload).await
    }
}
