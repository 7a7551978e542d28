use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::models::{CheckRow, CheckUpdate, ExpiredCheck};
use crate::db::services::CHANNELS_SNAPSHOT;
use crate::error::AppError;

const CHECK_COLUMNS: &str = "id, name, description, interval, grace, status, last_ping, next_ping, last_started, user_id";

/// Locks a check row for the rest of the transaction.
pub async fn lock_check(conn: &mut PgConnection, check_id: Uuid) -> Result<CheckRow, AppError> {
    let sql = format!("SELECT {CHECK_COLUMNS} FROM checks WHERE id = $1 FOR UPDATE");
    sqlx::query_as::<_, CheckRow>(&sql)
        .bind(check_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotExist(format!("check {check_id} not found")))
}

/// Like [`lock_check`], but a check owned by someone else is reported as missing.
pub async fn lock_owned_check(
    conn: &mut PgConnection,
    check_id: Uuid,
    user_id: i32,
) -> Result<CheckRow, AppError> {
    let sql = format!("SELECT {CHECK_COLUMNS} FROM checks WHERE id = $1 AND user_id = $2 FOR UPDATE");
    sqlx::query_as::<_, CheckRow>(&sql)
        .bind(check_id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotExist(format!("check {check_id} not found")))
}

pub async fn apply_update(
    conn: &mut PgConnection,
    check_id: Uuid,
    update: &CheckUpdate,
) -> Result<(), AppError> {
    let result = sqlx::query(
        r#"
        UPDATE checks
        SET status = $1, last_ping = $2, next_ping = $3, last_started = $4
        WHERE id = $5
        "#,
    )
    .bind(update.status)
    .bind(update.last_ping)
    .bind(update.next_ping)
    .bind(update.last_started)
    .bind(check_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotExist(format!("check {check_id} not found")));
    }
    Ok(())
}

/// Claims every `up` check past `next_ping + grace`. Rows already locked by
/// another poller are skipped, so concurrent pollers never claim the same check.
pub async fn claim_expired(conn: &mut PgConnection) -> Result<Vec<ExpiredCheck>, AppError> {
    let sql = format!(
        r#"
        SELECT ch.id, ch.name, ch.next_ping, ch.grace, {CHANNELS_SNAPSHOT} AS channels
        FROM checks ch
        WHERE ch.status = 'up'
          AND ch.next_ping IS NOT NULL
          AND current_timestamp > ch.next_ping + make_interval(secs => ch.grace)
        FOR UPDATE OF ch SKIP LOCKED
        "#
    );
    let rows = sqlx::query_as::<_, ExpiredCheck>(&sql)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

/// Marks the given checks `down` and clears their deadline.
pub async fn set_down(conn: &mut PgConnection, check_ids: &[Uuid]) -> Result<u64, AppError> {
    if check_ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query(
        "UPDATE checks SET status = 'down', next_ping = NULL WHERE id = ANY($1)",
    )
    .bind(check_ids)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
