use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum CheckStatus {
    New,
    Started,
    Up,
    Down,
    Paused,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CheckStatus::New => "new",
            CheckStatus::Started => "started",
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
            CheckStatus::Paused => "paused",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum PingKind {
    Start,
    Success,
    Fail,
}

impl fmt::Display for PingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PingKind::Start => "start",
            PingKind::Success => "success",
            PingKind::Fail => "fail",
        };
        f.write_str(text)
    }
}

/// Target state of a flip. Only `Up` and `Down` are ever delivered as notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum FlipState {
    Up,
    Down,
    Paused,
}

impl fmt::Display for FlipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FlipState::Up => "up",
            FlipState::Down => "down",
            FlipState::Paused => "paused",
        };
        f.write_str(text)
    }
}
