//! PostgreSQL access. Every store operation takes the transaction handle
//! explicitly; callers open a unit of work with [`begin`] and close it with
//! [`complete`].

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

use crate::config::DatabaseConfig;

pub mod enums;
pub mod models;
pub mod services;

pub type Tx = Transaction<'static, Postgres>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

impl IsolationLevel {
    fn statement(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
        }
    }
}

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url())
        .await
}

/// Opens a transaction at the given isolation level.
pub async fn begin(pool: &PgPool, level: IsolationLevel) -> Result<Tx, sqlx::Error> {
    let mut tx = pool.begin().await?;
    // must be the first statement of the transaction
    sqlx::query(level.statement()).execute(&mut *tx).await?;
    Ok(tx)
}

/// Commits on `Ok`, rolls back on `Err`. The original error is returned even
/// if the rollback itself fails.
pub async fn complete<T, E>(tx: Tx, result: Result<T, E>) -> Result<T, E>
where
    E: From<sqlx::Error>,
{
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Failed to roll back transaction");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_statements() {
        assert!(IsolationLevel::RepeatableRead.statement().ends_with("REPEATABLE READ"));
        assert!(IsolationLevel::ReadCommitted.statement().ends_with("READ COMMITTED"));
    }
}
