use axum::{
    extract::rejection::{FormRejection, QueryRejection},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Body of every API response.
///
/// Exactly one of `data` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self {
            data: None,
            error: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppError {
    status: StatusCode,
    detail: String,
}

impl AppError {
    /// Create a new [`AppError`].
    pub fn new(status: StatusCode, message: impl ToString) -> AppError {
        Self {
            status,
            detail: message.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let json = Json(Envelope::<()>::error(self.detail));
        (self.status, json).into_response()
    }
}

impl From<Error> for AppError {
    fn from(value: Error) -> Self {
        let status = match &value {
            Error::Invalid(_) | Error::UnknownToken => StatusCode::BAD_REQUEST,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::IdentityMismatch | Error::ReadOnly => StatusCode::FORBIDDEN,
            Error::Internal(err) => {
                error!("internal error: {err:#}");
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };
        Self::new(status, value)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Error::Internal(value).into()
    }
}

impl From<QueryRejection> for AppError {
    fn from(value: QueryRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, value.body_text())
    }
}

impl From<FormRejection> for AppError {
    fn from(value: FormRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, value.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvalidInput;

    #[test]
    fn status_per_kind() {
        let cases = [
            (Error::from(InvalidInput::Latitude), StatusCode::BAD_REQUEST),
            (Error::UnknownToken, StatusCode::BAD_REQUEST),
            (Error::NotFound, StatusCode::NOT_FOUND),
            (Error::IdentityMismatch, StatusCode::FORBIDDEN),
            (Error::ReadOnly, StatusCode::FORBIDDEN),
            (
                Error::from(anyhow::anyhow!("disk on fire")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    #[test]
    fn internal_details_stay_private() {
        let err = AppError::from(anyhow::anyhow!("table nodes-1 is corrupt"));
        assert_eq!(err.detail, "internal error");
        let err = AppError::from(Error::from(InvalidInput::Address));
        assert_eq!(err.detail, "addressInvalid");
    }
}
