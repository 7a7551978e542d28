use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::enums::FlipState;

/// A notification target as it travels in the channel snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Channel {
    Email {
        email: String,
    },
    Webhook {
        #[serde(rename = "webhookURLUp")]
        url_up: String,
        #[serde(rename = "webhookURLDown")]
        url_down: String,
    },
}

impl Channel {
    /// URL to call for a flip, `None` for email channels.
    pub fn webhook_url(&self, flip_to: FlipState) -> Option<&str> {
        match self {
            Channel::Email { .. } => None,
            Channel::Webhook { url_up, url_down } => match flip_to {
                FlipState::Up => Some(url_up.as_str()),
                FlipState::Down | FlipState::Paused => Some(url_down.as_str()),
            },
        }
    }
}

/// Queue payload: one flip plus the channels of its check at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub check_name: String,
    pub flip_to: FlipState,
    pub flip_date: DateTime<Utc>,
    pub channels: Vec<Channel>,
}

impl Notification {
    pub fn subject(&self) -> String {
        format!("Check {} is {}", self.check_name, self.flip_to)
    }

    pub fn text(&self) -> String {
        format!(
            "Your check {} is {}. Date: {}",
            self.check_name,
            self.flip_to,
            self.flip_date.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    pub fn emails(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter_map(|c| match c {
                Channel::Email { email } => Some(email.clone()),
                Channel::Webhook { .. } => None,
            })
            .collect()
    }

    pub fn webhooks(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter_map(|c| c.webhook_url(self.flip_to))
            .map(str::to_string)
            .collect()
    }
}
