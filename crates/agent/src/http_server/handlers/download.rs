use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::response::{IntoResponse, Response};
use common::prelude::{check_sign, hash_to_filename};
use http::{header, HeaderName, HeaderValue, StatusCode};
use storage::prelude::ServeAction;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::{ServeError, SignedQuery};
use crate::http_server::AppState;

pub const CACHE_CONTROL: &str = "max-age=2592000";
const BMCLAPI_HASH: HeaderName = HeaderName::from_static("x-bmclapi-hash");

pub async fn handler(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<SignedQuery>,
    request: Request,
) -> Result<Response, ServeError> {
    let hash = hash.to_lowercase();
    if !check_sign(
        &hash,
        &state.secret,
        query.s.as_deref(),
        query.e.as_deref(),
    ) {
        return Err(ServeError::InvalidSign);
    }

    let path = hash_to_filename(&hash);
    if !state.storage.exists(&path).await {
        return Err(ServeError::NotFound);
    }

    let name = query.name.as_deref().filter(|n| !n.is_empty());
    let served = state.storage.serve_file(&path, name).await?;

    let mut response = match served.action {
        ServeAction::File(file) => {
            let response = match ServeFile::new(file).oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
            let mut response = response.map(Body::new);
            set_cache_headers(&mut response, name);
            response
        }
        ServeAction::Bytes(bytes) => {
            let mut response = (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response();
            set_cache_headers(&mut response, name);
            response
        }
        ServeAction::Redirect(location) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        ServeAction::Status(code) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response(),
    };

    if let Ok(value) = HeaderValue::from_str(&hash) {
        response.headers_mut().insert(BMCLAPI_HASH, value);
    }
    if served.hits > 0 || served.bytes > 0 {
        state.counters.record(served.bytes, served.hits);
    }
    tracing::debug!(
        hash = %hash,
        status = response.status().as_u16(),
        bytes = served.bytes,
        "download served"
    );
    Ok(response)
}

fn set_cache_headers(response: &mut Response, name: Option<&str>) {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
    if let Some(value) = name.and_then(content_disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

/// `attachment; filename=...`, switching to the RFC 5987 form for
/// names that are not plain ASCII.
pub fn content_disposition(name: &str) -> Option<HeaderValue> {
    let value = if name.bytes().all(|b| b.is_ascii_graphic() || b == b' ') && !name.contains('"') {
        format!("attachment; filename=\"{}\"", name)
    } else {
        let encoded: String = url::form_urlencoded::byte_serialize(name.as_bytes())
            .collect::<String>()
            .replace('+', "%20");
        format!("attachment; filename*=UTF-8''{}", encoded)
    };
    HeaderValue::from_str(&value).ok()
}
