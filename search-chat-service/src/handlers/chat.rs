use crate::services::gate::{parse_request, Identity};
use crate::services::metrics;
use crate::startup::AppState;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use bytes::Bytes;
use service_core::error::AppError;
use service_core::middleware::RequestId;
use std::net::SocketAddr;

/// `POST /api/chat`.
///
/// Errors raised before generation starts come back as JSON with a status
/// code. Once the first engine stream is open the response is `200` with a
/// chunked `text/plain` body.
pub async fn chat(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request_id = request_id
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let identity = Identity::from_headers(&headers, peer.map(|ConnectInfo(addr)| addr.ip()));

    let started = match parse_request(&body) {
        Ok(request) => state.pipeline.start(request, identity, request_id).await,
        Err(e) => Err(e),
    };
    let stream = started.map_err(|e| {
        metrics::record_chat_request(e.category());
        tracing::warn!(category = e.category(), error = %e, "Chat request rejected");
        AppError::from(e)
    })?;

    tracing::debug!(request_id = %stream.request_id, "Streaming response");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream.into_body_stream()),
    )
        .into_response())
}
