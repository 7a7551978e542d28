use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::enums::PingKind;
use crate::db::models::{CheckRow, CheckUpdate, NewFlip, NewPing};
use crate::db::services::{check_service, flip_service, ping_service};
use crate::db::{self, IsolationLevel};
use crate::error::AppError;
use crate::lifecycle::{CheckState, LifecycleEvent, ping_duration, transition};

/// An inbound ping as seen by the HTTP layer.
#[derive(Debug, Clone)]
pub struct NewPingRequest {
    pub check_id: Uuid,
    pub kind: PingKind,
    pub source: String,
    pub user_agent: String,
    pub body: String,
}

/// Anything that can record a ping. The ingest router only depends on this.
#[async_trait]
pub trait PingRecorder: Send + Sync {
    async fn record_ping(&self, request: NewPingRequest) -> Result<(), AppError>;
}

/// Store operations one lifecycle unit of work needs, all against the
/// caller's transaction.
#[async_trait]
pub trait CheckStore: Send {
    async fn lock_check(&mut self, check_id: Uuid) -> Result<CheckRow, AppError>;
    async fn lock_owned_check(&mut self, check_id: Uuid, user_id: i32) -> Result<CheckRow, AppError>;
    async fn apply_update(&mut self, check_id: Uuid, update: &CheckUpdate) -> Result<(), AppError>;
    async fn create_flip(&mut self, flip: &NewFlip) -> Result<i64, AppError>;
    async fn last_ping(&mut self, check_id: Uuid) -> Result<Option<(PingKind, DateTime<Utc>)>, AppError>;
    async fn create_ping(&mut self, ping: &NewPing) -> Result<i64, AppError>;
}

#[async_trait]
impl CheckStore for PgConnection {
    async fn lock_check(&mut self, check_id: Uuid) -> Result<CheckRow, AppError> {
        check_service::lock_check(self, check_id).await
    }

    async fn lock_owned_check(&mut self, check_id: Uuid, user_id: i32) -> Result<CheckRow, AppError> {
        check_service::lock_owned_check(self, check_id, user_id).await
    }

    async fn apply_update(&mut self, check_id: Uuid, update: &CheckUpdate) -> Result<(), AppError> {
        check_service::apply_update(self, check_id, update).await
    }

    async fn create_flip(&mut self, flip: &NewFlip) -> Result<i64, AppError> {
        flip_service::create(self, flip).await
    }

    async fn last_ping(&mut self, check_id: Uuid) -> Result<Option<(PingKind, DateTime<Utc>)>, AppError> {
        ping_service::last_type_and_date(self, check_id).await
    }

    async fn create_ping(&mut self, ping: &NewPing) -> Result<i64, AppError> {
        ping_service::create(self, ping).await
    }
}

#[derive(Clone)]
pub struct LifecycleService {
    pool: PgPool,
}

impl LifecycleService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies a ping: check update, optional flip, then the ping record, all
    /// in one transaction. The check row lock serializes concurrent pings.
    pub async fn record_ping(&self, request: NewPingRequest) -> Result<(), AppError> {
        let at = Utc::now();
        let mut tx = db::begin(&self.pool, IsolationLevel::ReadCommitted).await?;
        let result = apply_ping(&mut *tx, request, at).await;
        db::complete(tx, result).await
    }

    pub async fn pause(&self, check_id: Uuid, user_id: i32) -> Result<(), AppError> {
        self.apply_user_event(check_id, user_id, LifecycleEvent::Pause).await
    }

    pub async fn resume(&self, check_id: Uuid, user_id: i32) -> Result<(), AppError> {
        self.apply_user_event(check_id, user_id, LifecycleEvent::Resume).await
    }

    async fn apply_user_event(
        &self,
        check_id: Uuid,
        user_id: i32,
        event: LifecycleEvent,
    ) -> Result<(), AppError> {
        let at = Utc::now();
        let mut tx = db::begin(&self.pool, IsolationLevel::ReadCommitted).await?;
        let result = apply_owned_event(&mut *tx, check_id, user_id, event, at).await;
        let outcome = db::complete(tx, result).await;
        if outcome.is_ok() {
            info!(%check_id, user_id, ?event, "Check lifecycle event applied");
        }
        outcome
    }
}

#[async_trait]
impl PingRecorder for LifecycleService {
    async fn record_ping(&self, request: NewPingRequest) -> Result<(), AppError> {
        LifecycleService::record_ping(self, request).await
    }
}

async fn apply_ping<S: CheckStore + ?Sized>(
    store: &mut S,
    request: NewPingRequest,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    let check = store.lock_check(request.check_id).await?;
    let prior = CheckState::from(&check);
    let next = transition(&prior, LifecycleEvent::Ping(request.kind), at)?;

    store.apply_update(check.id, &next.update).await?;
    if let Some(to) = next.flip {
        let flip_id = store
            .create_flip(&NewFlip {
                to,
                date: at,
                check_id: check.id,
            })
            .await?;
        debug!(check_id = %check.id, flip_id, flip_to = %to, "Flip recorded");
    }

    // read before the insert below, or the new ping would be its own predecessor
    let previous = match request.kind {
        PingKind::Start => None,
        PingKind::Success | PingKind::Fail => store.last_ping(check.id).await?,
    };

    let ping = NewPing {
        check_id: check.id,
        kind: request.kind,
        source: request.source,
        user_agent: request.user_agent,
        body: request.body,
        date: at,
        duration: ping_duration(previous, request.kind, at),
    };
    store.create_ping(&ping).await?;
    Ok(())
}

async fn apply_owned_event<S: CheckStore + ?Sized>(
    store: &mut S,
    check_id: Uuid,
    user_id: i32,
    event: LifecycleEvent,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    let check = store.lock_owned_check(check_id, user_id).await?;
    let next = transition(&CheckState::from(&check), event, at)?;

    store.apply_update(check.id, &next.update).await?;
    if let Some(to) = next.flip {
        store
            .create_flip(&NewFlip {
                to,
                date: at,
                check_id: check.id,
            })
            .await?;
    }
    Ok(())
}
