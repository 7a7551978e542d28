use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::enums::FlipState;
use crate::db::models::{NewFlip, UnprocessedFlip};
use crate::db::services::CHANNELS_SNAPSHOT;
use crate::error::AppError;

pub async fn create(conn: &mut PgConnection, flip: &NewFlip) -> Result<i64, AppError> {
    let id: i64 = sqlx::query_scalar(
        r#"INSERT INTO flips ("to", date, check_id) VALUES ($1, $2, $3) RETURNING id"#,
    )
    .bind(flip.to)
    .bind(flip.date)
    .bind(flip.check_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Inserts all flips with a single statement and returns `(flip id, check id)`
/// pairs. Row order of the result is not guaranteed.
pub async fn create_many(
    conn: &mut PgConnection,
    flips: &[NewFlip],
) -> Result<Vec<(i64, Uuid)>, AppError> {
    if flips.is_empty() {
        return Ok(Vec::new());
    }

    let states: Vec<FlipState> = flips.iter().map(|f| f.to).collect();
    let dates: Vec<_> = flips.iter().map(|f| f.date).collect();
    let check_ids: Vec<_> = flips.iter().map(|f| f.check_id).collect();

    let created: Vec<(i64, Uuid)> = sqlx::query_as(
        r#"
        INSERT INTO flips ("to", date, check_id)
        SELECT t.state, t.date, t.check_id
        FROM UNNEST($1::text[], $2::timestamptz[], $3::uuid[]) AS t(state, date, check_id)
        RETURNING id, check_id
        "#,
    )
    .bind(&states)
    .bind(&dates)
    .bind(&check_ids)
    .fetch_all(&mut *conn)
    .await?;
    Ok(created)
}

/// Claims unprocessed `up`/`down` flips, oldest first, with the owning check's
/// name and current channels. `exclude_ids` keeps flips inserted earlier in the
/// same unit of work out of the result.
pub async fn claim_unprocessed(
    conn: &mut PgConnection,
    exclude_ids: &[i64],
) -> Result<Vec<UnprocessedFlip>, AppError> {
    let sql = format!(
        r#"
        SELECT f.id, f."to", f.date, ch.name AS check_name, {CHANNELS_SNAPSHOT} AS channels
        FROM flips f
        JOIN checks ch ON ch.id = f.check_id
        WHERE f.processed = false
          AND f."to" IN ('up', 'down')
          AND f.id <> ALL($1)
        ORDER BY f.date, f.id
        FOR UPDATE OF f SKIP LOCKED
        "#
    );
    let rows = sqlx::query_as::<_, UnprocessedFlip>(&sql)
        .bind(exclude_ids)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

pub async fn mark_processed(conn: &mut PgConnection, flip_ids: &[i64]) -> Result<u64, AppError> {
    if flip_ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query("UPDATE flips SET processed = true WHERE id = ANY($1)")
        .bind(flip_ids)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
