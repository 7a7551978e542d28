use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use crate::db::enums::{CheckStatus, FlipState, PingKind};
use crate::notifications::models::Channel;

#[derive(Debug, Clone, FromRow)]
pub struct CheckRow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub interval: i32,
    pub grace: i32,
    pub status: CheckStatus,
    pub last_ping: Option<DateTime<Utc>>,
    pub next_ping: Option<DateTime<Utc>>,
    pub last_started: Option<DateTime<Utc>>,
    pub user_id: i32,
}

/// The mutable part of a check row, written back as a whole by the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckUpdate {
    pub status: CheckStatus,
    pub last_ping: Option<DateTime<Utc>>,
    pub next_ping: Option<DateTime<Utc>>,
    pub last_started: Option<DateTime<Utc>>,
}

/// An `up` check whose deadline plus grace has passed, locked by the current poller.
#[derive(Debug, Clone, FromRow)]
pub struct ExpiredCheck {
    pub id: Uuid,
    pub name: String,
    pub next_ping: DateTime<Utc>,
    pub grace: i32,
    pub channels: Json<Vec<Channel>>,
}

impl ExpiredCheck {
    /// The instant the check actually went silent: `next_ping + grace`.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.next_ping + chrono::Duration::seconds(i64::from(self.grace))
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct UnprocessedFlip {
    pub id: i64,
    pub to: FlipState,
    pub date: DateTime<Utc>,
    pub check_name: String,
    pub channels: Json<Vec<Channel>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFlip {
    pub to: FlipState,
    pub date: DateTime<Utc>,
    pub check_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NewPing {
    pub check_id: Uuid,
    pub kind: PingKind,
    pub source: String,
    pub user_agent: String,
    pub body: String,
    pub date: DateTime<Utc>,
    pub duration: Option<i32>,
}
