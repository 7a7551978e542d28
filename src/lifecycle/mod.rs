//! Check state machine.
//!
//! [`transition`] is pure: given the current state of a check and an event it
//! returns the new row values and the flip to record, if any. [`service`]
//! runs it inside a unit of work against the store.

use chrono::{DateTime, Duration, Utc};

use crate::db::enums::{CheckStatus, FlipState, PingKind};
use crate::db::models::{CheckRow, CheckUpdate};
use crate::error::AppError;

pub mod service;

pub use service::{LifecycleService, NewPingRequest, PingRecorder};

pub const MIN_SCHEDULE_SECS: i32 = 60;
pub const MAX_SCHEDULE_SECS: i32 = 31_536_000;

/// Snapshot of the fields the state machine reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckState {
    pub status: CheckStatus,
    pub interval: i32,
    pub grace: i32,
    pub last_ping: Option<DateTime<Utc>>,
    pub next_ping: Option<DateTime<Utc>>,
    pub last_started: Option<DateTime<Utc>>,
}

impl From<&CheckRow> for CheckState {
    fn from(row: &CheckRow) -> Self {
        Self {
            status: row.status,
            interval: row.interval,
            grace: row.grace,
            last_ping: row.last_ping,
            next_ping: row.next_ping,
            last_started: row.last_started,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Ping(PingKind),
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub update: CheckUpdate,
    pub flip: Option<FlipState>,
}

pub fn transition(
    prior: &CheckState,
    event: LifecycleEvent,
    at: DateTime<Utc>,
) -> Result<Transition, AppError> {
    let unchanged = CheckUpdate {
        status: prior.status,
        last_ping: prior.last_ping,
        next_ping: prior.next_ping,
        last_started: prior.last_started,
    };

    let result = match event {
        LifecycleEvent::Ping(PingKind::Start) => Transition {
            update: CheckUpdate {
                status: CheckStatus::Started,
                last_started: Some(at),
                ..unchanged
            },
            flip: None,
        },
        LifecycleEvent::Ping(PingKind::Success) => Transition {
            update: CheckUpdate {
                status: CheckStatus::Up,
                last_ping: Some(at),
                next_ping: Some(at + Duration::seconds(i64::from(prior.interval))),
                last_started: None,
            },
            flip: (prior.status != CheckStatus::Up).then_some(FlipState::Up),
        },
        LifecycleEvent::Ping(PingKind::Fail) => Transition {
            update: CheckUpdate {
                status: CheckStatus::Down,
                last_ping: Some(at),
                next_ping: None,
                last_started: None,
            },
            flip: (prior.status != CheckStatus::Down).then_some(FlipState::Down),
        },
        LifecycleEvent::Pause => {
            if prior.status == CheckStatus::Paused {
                return Err(AppError::Validation("check is paused already".to_string()));
            }
            Transition {
                update: CheckUpdate {
                    status: CheckStatus::Paused,
                    next_ping: None,
                    last_started: None,
                    ..unchanged
                },
                flip: Some(FlipState::Paused),
            }
        }
        LifecycleEvent::Resume => {
            if prior.status != CheckStatus::Paused {
                return Err(AppError::Validation("check is not paused".to_string()));
            }
            Transition {
                update: CheckUpdate {
                    status: CheckStatus::New,
                    ..unchanged
                },
                flip: None,
            }
        }
    };

    Ok(result)
}

/// Seconds since the previous ping, rounded, when that ping was a `start` and
/// the current one finishes the run.
pub fn ping_duration(
    previous: Option<(PingKind, DateTime<Utc>)>,
    kind: PingKind,
    at: DateTime<Utc>,
) -> Option<i32> {
    if kind == PingKind::Start {
        return None;
    }
    match previous {
        Some((PingKind::Start, started)) => {
            let millis = (at - started).num_milliseconds();
            let secs = (millis as f64 / 1000.0).round();
            i32::try_from(secs as i64).ok()
        }
        _ => None,
    }
}

/// True when the check is `up` and `now` is past `next_ping + grace`.
pub fn is_expired(check: &CheckState, now: DateTime<Utc>) -> bool {
    match (check.status, check.next_ping) {
        (CheckStatus::Up, Some(next_ping)) => {
            now > next_ping + Duration::seconds(i64::from(check.grace))
        }
        _ => false,
    }
}

pub fn validate_schedule(interval: i32, grace: i32) -> Result<(), AppError> {
    let range = MIN_SCHEDULE_SECS..=MAX_SCHEDULE_SECS;
    if !range.contains(&interval) {
        return Err(AppError::Validation(format!(
            "interval must be between {MIN_SCHEDULE_SECS} and {MAX_SCHEDULE_SECS} seconds"
        )));
    }
    if !range.contains(&grace) {
        return Err(AppError::Validation(format!(
            "grace must be between {MIN_SCHEDULE_SECS} and {MAX_SCHEDULE_SECS} seconds"
        )));
    }
    Ok(())
}
