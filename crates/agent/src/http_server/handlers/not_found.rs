use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Anything outside `/`, `/download` and `/measure`.
pub async fn not_found_handler(uri: Uri, headers: HeaderMap) -> Response {
    let wants_json = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));
    tracing::debug!(path = %uri.path(), "no route");

    if wants_json {
        let body = json!({ "error": "not found", "path": uri.path() });
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    }
    (StatusCode::NOT_FOUND, format!("no route for {}", uri.path())).into_response()
}
