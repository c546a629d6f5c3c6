use axum::{
    Json,
    extract::rejection::QueryRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::store::StoreError;

pub type AppResult<T> = Result<T, AppError>;

/// An error response: the status code and an optional detail message, sent as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    #[serde(serialize_with = "serialize_status")]
    status: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Default for AppError {
    fn default() -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl AppError {
    pub fn with_status(status: StatusCode) -> AppError {
        Self {
            status,
            detail: None,
        }
    }

    /// A 400 response explaining what is wrong with the request.
    pub fn bad_request(detail: impl ToString) -> AppError {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: Some(detail.to_string()),
        }
    }

    pub fn forbidden() -> AppError {
        Self::with_status(StatusCode::FORBIDDEN)
    }

    pub fn not_found() -> AppError {
        Self::with_status(StatusCode::NOT_FOUND)
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

/// Missing documents become 404. Everything else is a 500 whose body does not reveal the
/// cause.
impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::not_found(),
            err => {
                warn!(?err, "store operation failed");
                Self::default()
            }
        }
    }
}

impl From<QueryRejection> for AppError {
    fn from(value: QueryRejection) -> Self {
        Self::bad_request(value)
    }
}

fn serialize_status<S: Serializer>(status: &StatusCode, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_u16(status.as_u16())
}
