use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use storage::prelude::StorageError;

pub mod download;
pub mod measure;
mod not_found;

pub use not_found::not_found_handler;

/// `?s=&e=&name=` on signed URLs.
#[derive(Debug, Default, Deserialize)]
pub struct SignedQuery {
    pub s: Option<String>,
    pub e: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("invalid sign")]
    InvalidSign,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        match self {
            ServeError::InvalidSign => (StatusCode::FORBIDDEN, "invalid sign").into_response(),
            ServeError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ServeError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            ServeError::Storage(e) => {
                tracing::error!(error = %e, "error serving file");
                (StatusCode::INTERNAL_SERVER_ERROR, "error serving file").into_response()
            }
        }
    }
}

pub async fn index() -> String {
    format!(
        "{} {}",
        common::version::AGENT_NAME,
        common::version::build_info().package_version
    )
}
