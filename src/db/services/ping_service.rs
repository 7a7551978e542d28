use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::enums::PingKind;
use crate::db::models::NewPing;
use crate::error::AppError;

/// Type and date of the most recent ping for a check, if any.
pub async fn last_type_and_date(
    conn: &mut PgConnection,
    check_id: Uuid,
) -> Result<Option<(PingKind, DateTime<Utc>)>, AppError> {
    let row: Option<(PingKind, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT "type", date FROM pings
        WHERE check_id = $1
        ORDER BY date DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(check_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn create(conn: &mut PgConnection, ping: &NewPing) -> Result<i64, AppError> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO pings (check_id, "type", source, user_agent, body, date, duration)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(ping.check_id)
    .bind(ping.kind)
    .bind(&ping.source)
    .bind(&ping.user_agent)
    .bind(&ping.body)
    .bind(ping.date)
    .bind(ping.duration)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}
