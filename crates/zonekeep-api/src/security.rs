use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use crate::error::json_error;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const API_KEY_HEADER: &str = "x-api-key";
const MAX_REQUEST_ID_LEN: usize = 128;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    bearer_token(headers).or_else(|| {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

fn keys_match(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// Middleware: optional static API key (`Authorization: Bearer` or `X-API-Key`).
//
// With no key configured every request passes.
pub async fn require_api_key(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };
    let ok = presented_key(req.headers()).is_some_and(|got| keys_match(got.as_bytes(), expected.as_bytes()));
    if !ok {
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid API key");
    }
    next.run(req).await
}

// Middleware: propagate or mint `x-request-id` and run the request inside a span carrying it.
pub async fn request_id(req: Request<Body>, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    let mut resp = next.run(req).instrument(span).await;
    if let Ok(v) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_read_from_bearer_or_api_key_header() {
        let mut h = HeaderMap::new();
        assert_eq!(presented_key(&h), None);

        h.insert(API_KEY_HEADER, HeaderValue::from_static(" s3cret "));
        assert_eq!(presented_key(&h), Some("s3cret"));

        h.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer other"),
        );
        assert_eq!(presented_key(&h), Some("other"));
    }

    #[test]
    fn key_comparison_requires_exact_match() {
        assert!(keys_match(b"abc", b"abc"));
        assert!(!keys_match(b"abc", b"abd"));
        assert!(!keys_match(b"abc", b"abcd"));
    }
}
