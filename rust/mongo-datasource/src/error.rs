use crate::templating::TemplateError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Error reported by the backend inside an otherwise well-formed response.
    #[error("{0}")]
    Backend(String),

    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("backend returned no response")]
    EmptyResponse,
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Transport(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_) | ServiceError::Template(_) => StatusCode::BAD_REQUEST,
            ServiceError::Backend(_) | ServiceError::Transport(_) | ServiceError::EmptyResponse => {
                StatusCode::BAD_GATEWAY
            }
        };

        if !matches!(
            self,
            ServiceError::InvalidRequest(_) | ServiceError::Template(_) | ServiceError::Auth
        ) {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
