use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use common::prelude::check_sign;
use http::header;

use super::{ServeError, SignedQuery};
use crate::http_server::AppState;

pub const MAX_MEASURE_SIZE: u64 = 200;
const MIB: usize = 1024 * 1024;
const PATTERN: [u8; 4] = [0x00, 0x66, 0xcc, 0xff];

/// One mebibyte of the probe pattern.
pub fn measure_chunk() -> Bytes {
    PATTERN.iter().copied().cycle().take(MIB).collect::<Vec<u8>>().into()
}

/// Stream `size` MiB so the coordinator can measure bandwidth.
pub async fn handler(
    State(state): State<AppState>,
    Path(size): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, ServeError> {
    if !check_sign(
        &format!("/measure/{}", size),
        &state.secret,
        query.s.as_deref(),
        query.e.as_deref(),
    ) {
        return Err(ServeError::InvalidSign);
    }

    let size: u64 = size
        .parse()
        .map_err(|_| ServeError::BadRequest("size must be an integer"))?;
    if size > MAX_MEASURE_SIZE {
        return Err(ServeError::BadRequest("size too large"));
    }

    let chunk = measure_chunk();
    let body = Body::from_stream(futures::stream::iter(
        (0..size).map(move |_| Ok::<_, Infallible>(chunk.clone())),
    ));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, (size * MIB as u64).to_string()),
        ],
        body,
    )
        .into_response())
}
