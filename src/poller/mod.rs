//! Expiry poller: one transaction per tick that expires silent checks,
//! records their flips, publishes every pending flip and marks it processed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::db::enums::FlipState;
use crate::db::models::{ExpiredCheck, NewFlip, UnprocessedFlip};
use crate::db::services::{check_service, flip_service};
use crate::db::{self, IsolationLevel};
use crate::error::AppError;
use crate::notifications::models::Notification;
use crate::queue::{Publisher, QueueError};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Store error: {0}")]
    Store(#[from] AppError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Inconsistent tick state: {0}")]
    Inconsistent(String),
}

impl From<sqlx::Error> for PollError {
    fn from(err: sqlx::Error) -> Self {
        PollError::Store(AppError::from(err))
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub expired: usize,
    pub published: usize,
}

/// Messages for one publish, with the flip ids they stand for.
#[derive(Debug, Default)]
pub struct Batch {
    pub flip_ids: Vec<i64>,
    pub messages: Vec<Vec<u8>>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.flip_ids.is_empty()
    }
}

/// Store operations one tick needs, all against the caller's transaction.
#[async_trait]
pub trait PollStore: Send {
    async fn claim_expired(&mut self) -> Result<Vec<ExpiredCheck>, AppError>;
    async fn set_down(&mut self, check_ids: &[Uuid]) -> Result<u64, AppError>;
    async fn create_flips(&mut self, flips: &[NewFlip]) -> Result<Vec<(i64, Uuid)>, AppError>;
    async fn claim_unprocessed(&mut self, exclude_ids: &[i64]) -> Result<Vec<UnprocessedFlip>, AppError>;
    async fn mark_processed(&mut self, flip_ids: &[i64]) -> Result<u64, AppError>;
}

#[async_trait]
impl PollStore for PgConnection {
    async fn claim_expired(&mut self) -> Result<Vec<ExpiredCheck>, AppError> {
        check_service::claim_expired(self).await
    }

    async fn set_down(&mut self, check_ids: &[Uuid]) -> Result<u64, AppError> {
        check_service::set_down(self, check_ids).await
    }

    async fn create_flips(&mut self, flips: &[NewFlip]) -> Result<Vec<(i64, Uuid)>, AppError> {
        flip_service::create_many(self, flips).await
    }

    async fn claim_unprocessed(&mut self, exclude_ids: &[i64]) -> Result<Vec<UnprocessedFlip>, AppError> {
        flip_service::claim_unprocessed(self, exclude_ids).await
    }

    async fn mark_processed(&mut self, flip_ids: &[i64]) -> Result<u64, AppError> {
        flip_service::mark_processed(self, flip_ids).await
    }
}

/// Builds one message per flip: previously recorded flips first, then the
/// flips synthesized for `expired`. `created` holds `(flip id, check id)` for
/// the synthesized flips, in any order.
pub fn build_batch(
    pending: &[UnprocessedFlip],
    expired: &[ExpiredCheck],
    created: &[(i64, Uuid)],
) -> Result<Batch, PollError> {
    let by_check: HashMap<Uuid, i64> = created.iter().map(|(id, check_id)| (*check_id, *id)).collect();
    if expired.len() != created.len() || by_check.len() != created.len() {
        return Err(PollError::Inconsistent(format!(
            "{} expired checks but {} new flips",
            expired.len(),
            created.len()
        )));
    }

    let mut batch = Batch::default();
    for flip in pending {
        let notification = Notification {
            check_name: flip.check_name.clone(),
            flip_to: flip.to,
            flip_date: flip.date,
            channels: flip.channels.0.clone(),
        };
        batch.messages.push(serde_json::to_vec(&notification)?);
        batch.flip_ids.push(flip.id);
    }
    for check in expired {
        let id = by_check.get(&check.id).copied().ok_or_else(|| {
            PollError::Inconsistent(format!("no flip recorded for expired check {}", check.id))
        })?;
        let notification = Notification {
            check_name: check.name.clone(),
            flip_to: FlipState::Down,
            flip_date: check.deadline(),
            channels: check.channels.0.clone(),
        };
        batch.messages.push(serde_json::to_vec(&notification)?);
        batch.flip_ids.push(id);
    }
    Ok(batch)
}

pub struct Poller<P: Publisher> {
    pool: PgPool,
    publisher: Arc<P>,
    interval: Duration,
}

impl<P: Publisher> Poller<P> {
    pub fn new(pool: PgPool, publisher: Arc<P>, interval: Duration) -> Self {
        Self {
            pool,
            publisher,
            interval,
        }
    }

    /// Ticks until `shutdown` flips to true. A running tick always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "Poller started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(report) if report.published > 0 || report.expired > 0 => {
                    info!(expired = report.expired, flip_count = report.published, "Poll tick published flips");
                }
                Ok(_) => debug!("Poll tick found nothing to do"),
                Err(e) => error!(error = %e, "Poll tick failed, rolled back"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Poller stopped");
    }

    /// One unit of work. Any error rolls back everything, including the
    /// status changes of expired checks.
    pub async fn tick(&self) -> Result<TickReport, PollError> {
        let mut tx = db::begin(&self.pool, IsolationLevel::RepeatableRead).await?;
        let result = self.tick_in(&mut *tx).await;
        db::complete(tx, result).await
    }

    async fn tick_in<S: PollStore + ?Sized>(&self, store: &mut S) -> Result<TickReport, PollError> {
        let expired = store.claim_expired().await?;
        if !expired.is_empty() {
            let ids: Vec<_> = expired.iter().map(|c| c.id).collect();
            store.set_down(&ids).await?;
            debug!(count = expired.len(), "Expired checks set down");
        }

        let new_flips: Vec<NewFlip> = expired
            .iter()
            .map(|check| NewFlip {
                to: FlipState::Down,
                date: check.deadline(),
                check_id: check.id,
            })
            .collect();
        let created = store.create_flips(&new_flips).await?;
        let new_ids: Vec<i64> = created.iter().map(|(id, _)| *id).collect();

        let pending = store.claim_unprocessed(&new_ids).await?;

        let batch = build_batch(&pending, &expired, &created)?;
        if batch.is_empty() {
            return Ok(TickReport::default());
        }

        let published = batch.flip_ids.len();
        self.publisher.publish_batch(batch.messages).await?;
        store.mark_processed(&batch.flip_ids).await?;

        Ok(TickReport {
            expired: expired.len(),
            published,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::models::Channel;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use sqlx::postgres::PgPoolOptions;
    use sqlx::types::Json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        batches: Mutex<Vec<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish_batch(&self, messages: Vec<Vec<u8>>) -> Result<(), QueueError> {
            self.batches.lock().unwrap().push(messages);
            Ok(())
        }
    }

    struct NackingPublisher;

    #[async_trait]
    impl Publisher for NackingPublisher {
        async fn publish_batch(&self, _messages: Vec<Vec<u8>>) -> Result<(), QueueError> {
            Err(QueueError::Nacked("m-1".to_string()))
        }
    }

    /// In-memory tick store. New flips are handed out from id 100 and
    /// returned in reverse insertion order.
    #[derive(Default)]
    struct FakeStore {
        expired: Vec<ExpiredCheck>,
        pending: Vec<UnprocessedFlip>,
        set_down: Vec<Uuid>,
        created: Vec<NewFlip>,
        excluded: Vec<i64>,
        processed: Option<Vec<i64>>,
    }

    #[async_trait]
    impl PollStore for FakeStore {
        async fn claim_expired(&mut self) -> Result<Vec<ExpiredCheck>, AppError> {
            Ok(self.expired.clone())
        }

        async fn set_down(&mut self, check_ids: &[Uuid]) -> Result<u64, AppError> {
            self.set_down.extend_from_slice(check_ids);
            Ok(check_ids.len() as u64)
        }

        async fn create_flips(&mut self, flips: &[NewFlip]) -> Result<Vec<(i64, Uuid)>, AppError> {
            self.created.extend_from_slice(flips);
            Ok(flips
                .iter()
                .enumerate()
                .map(|(i, flip)| (100 + i as i64, flip.check_id))
                .rev()
                .collect())
        }

        async fn claim_unprocessed(&mut self, exclude_ids: &[i64]) -> Result<Vec<UnprocessedFlip>, AppError> {
            self.excluded = exclude_ids.to_vec();
            Ok(self.pending.clone())
        }

        async fn mark_processed(&mut self, flip_ids: &[i64]) -> Result<u64, AppError> {
            self.processed = Some(flip_ids.to_vec());
            Ok(flip_ids.len() as u64)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn email(address: &str) -> Channel {
        Channel::Email {
            email: address.to_string(),
        }
    }

    fn expired_check(name: &str) -> ExpiredCheck {
        ExpiredCheck {
            id: Uuid::new_v4(),
            name: name.to_string(),
            next_ping: t0(),
            grace: 60,
            channels: Json(vec![email("ops@example.com")]),
        }
    }

    fn pending_flip(id: i64, name: &str) -> UnprocessedFlip {
        UnprocessedFlip {
            id,
            to: FlipState::Up,
            date: t0(),
            check_name: name.to_string(),
            channels: Json(vec![]),
        }
    }

    fn lazy_pool() -> PgPool {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(500))
            .connect_lazy(&format!("postgres://u:p@127.0.0.1:{port}/db"))
            .unwrap()
    }

    fn check_names(messages: &[Vec<u8>]) -> Vec<String> {
        messages
            .iter()
            .map(|m| serde_json::from_slice::<Notification>(m).unwrap().check_name)
            .collect()
    }

    #[test]
    fn expired_check_flips_at_deadline_not_now() {
        let check = ExpiredCheck {
            next_ping: t0() + ChronoDuration::seconds(60),
            grace: 3600,
            ..expired_check("backup")
        };
        let created = [(42, check.id)];

        let batch = build_batch(&[], &[check], &created).unwrap();
        assert_eq!(batch.flip_ids, vec![42]);

        let notification: Notification = serde_json::from_slice(&batch.messages[0]).unwrap();
        assert_eq!(notification.flip_to, FlipState::Down);
        assert_eq!(notification.flip_date, t0() + ChronoDuration::seconds(3660));
        assert_eq!(notification.check_name, "backup");
        assert_eq!(notification.channels, vec![email("ops@example.com")]);
    }

    #[test]
    fn pending_flips_come_before_new_ones() {
        let pending = vec![pending_flip(7, "web")];
        let expired = vec![expired_check("cron")];
        let created = [(8, expired[0].id)];

        let batch = build_batch(&pending, &expired, &created).unwrap();
        assert_eq!(batch.flip_ids, vec![7, 8]);
        let first: Notification = serde_json::from_slice(&batch.messages[0]).unwrap();
        assert_eq!(first.flip_to, FlipState::Up);
        assert_eq!(first.check_name, "web");
    }

    #[test]
    fn new_flip_ids_are_paired_by_check() {
        let expired = vec![expired_check("a"), expired_check("b")];
        let created = [(11, expired[1].id), (10, expired[0].id)];

        let batch = build_batch(&[], &expired, &created).unwrap();
        assert_eq!(batch.flip_ids, vec![10, 11]);
        assert_eq!(check_names(&batch.messages), vec!["a", "b"]);
    }

    #[test]
    fn nothing_pending_means_empty_batch() {
        let batch = build_batch(&[], &[], &[]).unwrap();
        assert!(batch.is_empty());
        assert!(batch.messages.is_empty());
    }

    #[test]
    fn mismatched_ids_are_rejected() {
        let expired = vec![expired_check("x")];
        assert!(matches!(
            build_batch(&[], &expired, &[]),
            Err(PollError::Inconsistent(_))
        ));
        assert!(matches!(
            build_batch(&[], &expired, &[(1, Uuid::new_v4())]),
            Err(PollError::Inconsistent(_))
        ));
    }

    #[tokio::test]
    async fn successful_publish_marks_exactly_the_published_flips() {
        let mut store = FakeStore {
            expired: vec![expired_check("a"), expired_check("b")],
            pending: vec![pending_flip(7, "web")],
            ..Default::default()
        };
        let publisher = Arc::new(RecordingPublisher::default());
        let poller = Poller::new(lazy_pool(), publisher.clone(), Duration::from_millis(10));

        let report = poller.tick_in(&mut store).await.unwrap();

        assert_eq!(report, TickReport { expired: 2, published: 3 });
        let expired_ids: Vec<Uuid> = store.expired.iter().map(|c| c.id).collect();
        assert_eq!(store.set_down, expired_ids);
        assert!(store.created.iter().all(|f| f.to == FlipState::Down));
        assert_eq!(store.excluded, vec![101, 100]);
        assert_eq!(store.processed, Some(vec![7, 100, 101]));

        let batches = publisher.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(check_names(&batches[0]), vec!["web", "a", "b"]);
    }

    #[tokio::test]
    async fn publish_failure_leaves_flips_unprocessed() {
        let mut store = FakeStore {
            expired: vec![expired_check("a")],
            pending: vec![pending_flip(7, "web")],
            ..Default::default()
        };
        let poller = Poller::new(lazy_pool(), Arc::new(NackingPublisher), Duration::from_millis(10));

        let result = poller.tick_in(&mut store).await;

        assert!(matches!(result, Err(PollError::Queue(QueueError::Nacked(_)))));
        assert_eq!(store.processed, None);
    }

    #[tokio::test]
    async fn idle_tick_publishes_nothing() {
        let mut store = FakeStore::default();
        let publisher = Arc::new(RecordingPublisher::default());
        let poller = Poller::new(lazy_pool(), publisher.clone(), Duration::from_millis(10));

        let report = poller.tick_in(&mut store).await.unwrap();

        assert_eq!(report, TickReport::default());
        assert!(publisher.batches.lock().unwrap().is_empty());
        assert_eq!(store.processed, None);
    }

    #[tokio::test]
    async fn failed_tick_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let poller = Poller::new(lazy_pool(), publisher.clone(), Duration::from_millis(10));

        assert!(matches!(poller.tick().await, Err(PollError::Store(_))));
        assert!(publisher.batches.lock().unwrap().is_empty());
    }
}
