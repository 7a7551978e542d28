use thiserror::Error;

/// Coarse classification of an [`AppError`], shared with the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotExist,
    Forbidden,
    Duplicate,
    Unauthorized,
    Other,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotExist(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Duplicate: {0}")]
    Duplicate(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Internal error: {0}")]
    Other(String),
    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::NotExist(_) => ErrorKind::NotExist,
            AppError::Forbidden(_) => ErrorKind::Forbidden,
            AppError::Duplicate(_) => ErrorKind::Duplicate,
            AppError::Unauthorized(_) => ErrorKind::Unauthorized,
            AppError::Other(_) | AppError::Database(_) => ErrorKind::Other,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotExist("record not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::Duplicate(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                AppError::NotExist(db_err.message().to_string())
            }
            _ => AppError::Database(err),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Other(format!("JSON serialization/deserialization error: {err}"))
    }
}
