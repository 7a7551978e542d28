use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EmailSender, SenderError};
use crate::config::MailjetConfig;

/// Mailjet Send API v3.1.
pub struct MailjetSender {
    client: Client,
    endpoint: String,
    api_key: String,
    secret_key: String,
    sender: Contact,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Contact {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct OutboundMessage<'a> {
    from: &'a Contact,
    to: Vec<Contact>,
    subject: &'a str,
    text_part: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendRequest<'a> {
    messages: Vec<OutboundMessage<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendResponse {
    #[serde(default)]
    messages: Vec<MessageResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MessageResult {
    status: String,
}

impl MailjetSender {
    pub fn new(config: &MailjetConfig, timeout: Duration) -> Result<Self, SenderError> {
        if config.sender_email.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "sender email must not be empty".to_string(),
            ));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/v3.1/send", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            sender: Contact {
                email: config.sender_email.clone(),
                name: Some(config.sender_name.clone()).filter(|n| !n.is_empty()),
            },
        })
    }
}

#[async_trait]
impl EmailSender for MailjetSender {
    async fn send_batch(
        &self,
        recipients: &[String],
        subject: &str,
        text: &str,
    ) -> Result<(), SenderError> {
        let request = SendRequest {
            messages: vec![OutboundMessage {
                from: &self.sender,
                to: recipients
                    .iter()
                    .map(|email| Contact {
                        email: email.clone(),
                        name: None,
                    })
                    .collect(),
                subject,
                text_part: text,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.api_key, Some(&self.secret_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(SenderError::SendFailed(format!(
                "Mailjet returned non-success status: {status}. Body: {error_body}"
            )));
        }

        let body: SendResponse = response.json().await?;
        if let Some(failed) = body.messages.iter().find(|m| m.status != "success") {
            return Err(SenderError::SendFailed(format!(
                "Mailjet rejected message with status {}",
                failed.status
            )));
        }

        debug!(recipients = recipients.len(), "Mailjet accepted email batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::{Json, Router, extract::State, routing::post};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    async fn send(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        captured.requests.lock().unwrap().push((auth, body));
        Json(json!({"Messages": [{"Status": "success"}]}))
    }

    async fn spawn_mailjet() -> (String, Captured) {
        let captured = Captured::default();
        let app = Router::new()
            .route("/v3.1/send", post(send))
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    fn config(base_url: String) -> MailjetConfig {
        MailjetConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            sender_name: "Pulsewatch".to_string(),
            sender_email: "noreply@example.com".to_string(),
            base_url,
        }
    }

    #[tokio::test]
    async fn sends_all_recipients_in_one_call() {
        let (base_url, captured) = spawn_mailjet().await;
        let sender = MailjetSender::new(&config(base_url), Duration::from_secs(5)).unwrap();

        let recipients = vec!["a@example.com".to_string(), "b@example.com".to_string()];
        sender
            .send_batch(&recipients, "Check db is down", "Your check db is down.")
            .await
            .unwrap();

        let requests = captured.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (auth, body) = &requests[0];
        assert!(auth.as_deref().unwrap().starts_with("Basic "));

        let message = &body["Messages"][0];
        assert_eq!(message["From"]["Email"], "noreply@example.com");
        assert_eq!(message["From"]["Name"], "Pulsewatch");
        assert_eq!(message["To"].as_array().unwrap().len(), 2);
        assert_eq!(message["To"][1]["Email"], "b@example.com");
        assert_eq!(message["Subject"], "Check db is down");
        assert_eq!(message["TextPart"], "Your check db is down.");
    }

    #[tokio::test]
    async fn unreachable_provider_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender =
            MailjetSender::new(&config(format!("http://{addr}")), Duration::from_secs(1)).unwrap();
        let result = sender
            .send_batch(&["a@example.com".to_string()], "s", "t")
            .await;
        assert!(matches!(result, Err(SenderError::NetworkError(_))));
    }
}
