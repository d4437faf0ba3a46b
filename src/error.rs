use std::collections::BTreeMap;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::auth::password::PasswordError;
use crate::auth::repo::StoreError;

/// Field name → message, as accumulated by the validator.
pub type FieldErrors = BTreeMap<String, String>;

/// Request-level error taxonomy. Every variant maps to exactly one status.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed")]
    Validation(FieldErrors),

    #[error("{0}")]
    BadRequest(String),

    #[error("invalid authentication credentials")]
    InvalidCredentials,

    #[error("invalid or missing authentication token")]
    InvalidAuthenticationHeader,

    #[error("invalid or expired authentication token")]
    InvalidOrExpiredToken,

    #[error("you must be authenticated to access this resource")]
    Unauthorized,

    #[error("your user account must be activated to access this resource")]
    Forbidden,

    #[error("the requested resource could not be found")]
    NotFound,

    #[error("unable to update the record due to an edit conflict, please try again")]
    EditConflict,

    #[error("store operation timed out")]
    Timeout,

    #[error("persistence error: {0}")]
    Persistence(#[source] sqlx::Error),

    #[error("server error: {0}")]
    ServerError(#[source] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials
            | AppError::InvalidAuthenticationHeader
            | AppError::InvalidOrExpiredToken
            | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::EditConflict => StatusCode::CONFLICT,
            AppError::Timeout | AppError::Persistence(_) | AppError::ServerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn field(field: &str, message: &str) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), message.to_string());
        AppError::Validation(errors)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AppError::NotFound,
            StoreError::EditConflict => AppError::EditConflict,
            StoreError::DuplicateEmail => {
                AppError::field("email", "a user with this email address already exists")
            }
            StoreError::Timeout => AppError::Timeout,
            StoreError::Persistence(e) => AppError::Persistence(e),
        }
    }
}

impl From<PasswordError> for AppError {
    fn from(e: PasswordError) -> Self {
        AppError::ServerError(anyhow::Error::new(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Validation(fields) => json!({ "error": fields }),
            AppError::Timeout | AppError::Persistence(_) | AppError::ServerError(_) => {
                error!(error = %self, "request failed");
                // Details stay in the log.
                json!({ "error": "the server encountered a problem and could not process your request" })
            }
            other => json!({ "error": other.to_string() }),
        };

        let mut res = (status, Json(body)).into_response();
        if matches!(
            self,
            AppError::InvalidAuthenticationHeader | AppError::InvalidOrExpiredToken
        ) {
            res.headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        res
    }
}
