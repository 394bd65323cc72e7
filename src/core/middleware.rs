//! HTTP middleware for request tracking.
//!
//! Every request gets an id (taken from `x-request-id` when the client sends
//! one) which is stored in task-local context for the duration of the
//! handler and echoed back in the response headers.

use crate::core::logging::{generate_request_id, REQUEST_ID};
use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied request id accepted verbatim.
const MAX_REQUEST_ID_LEN: usize = 128;

fn client_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(|id| id.to_string())
}

/// Assign a request id, log the access line and echo the id back.
pub async fn request_context_middleware(request: Request, next: Next) -> Response {
    let request_id = client_request_id(request.headers()).unwrap_or_else(generate_request_id);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let mut response = REQUEST_ID
        .scope(request_id.clone(), async move { next.run(request).await })
        .await;

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;
    if status >= 500 {
        tracing::warn!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status,
            duration_ms = duration_ms,
            "Request failed"
        );
    } else {
        tracing::info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status,
            duration_ms = duration_ms,
            "Request completed"
        );
    }

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
