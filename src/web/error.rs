use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::error::{AppError, ErrorKind};

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotExist => StatusCode::NOT_FOUND,
        ErrorKind::Duplicate => StatusCode::CONFLICT,
        ErrorKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(self.kind());
        let message = match &self {
            AppError::Validation(msg)
            | AppError::NotExist(msg)
            | AppError::Forbidden(msg)
            | AppError::Duplicate(msg)
            | AppError::Unauthorized(msg) => msg.clone(),
            // internal details stay in the log
            AppError::Other(_) | AppError::Database(_) => {
                error!(error = %self, "Request failed with internal error");
                "internal server error".to_string()
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
