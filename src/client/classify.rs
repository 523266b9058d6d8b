//! Mapping of HTTP outcomes onto [`ApiError`].

use super::ApiError;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RETRY_AFTER};
use reqwest::{Error as ReqwestError, StatusCode};
use std::time::Duration;

/// Longest response body excerpt kept in error messages
const MAX_BODY_EXCERPT: usize = 200;

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ApiError {
    let detail = format!("HTTP {}: {}", status.as_u16(), excerpt(body));
    match status.as_u16() {
        401 => ApiError::Auth(detail),
        403 => ApiError::PermissionDenied(detail),
        404 => ApiError::NotFound(detail),
        429 => ApiError::RateLimited { retry_after },
        408 => ApiError::Network(detail),
        _ if status.is_server_error() => ApiError::Network(detail),
        _ => ApiError::Protocol(detail),
    }
}

/// Classify a transport-level reqwest error.
pub fn classify_transport(err: &ReqwestError) -> ApiError {
    if err.is_timeout() {
        return ApiError::Network(format!("timeout: {}", without_url(err)));
    }
    if err.is_connect() {
        return ApiError::Network(format!("connection failed: {}", without_url(err)));
    }
    if err.is_decode() {
        return ApiError::Protocol(format!("invalid response body: {}", without_url(err)));
    }
    if err.is_builder() {
        return ApiError::Protocol(format!("invalid request: {}", without_url(err)));
    }
    ApiError::Network(without_url(err))
}

/// Parse a `Retry-After` header given in seconds.
///
/// HTTP-date values are ignored; the retry policy's own backoff applies then.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Parse the `x-next-page` pagination header; empty means last page.
pub fn parse_next_page(headers: &HeaderMap) -> Option<u32> {
    let value = headers.get("x-next-page")?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    value.parse().ok()
}

/// Parse `Content-Range: bytes <start>-<end>/<total>` into the start offset
/// and, when known, the total size.
pub fn parse_content_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?.trim();
    let (range, total) = value.strip_prefix("bytes ")?.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return "(empty body)".to_string();
    }
    match body.char_indices().nth(MAX_BODY_EXCERPT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

fn without_url(err: &ReqwestError) -> String {
    // Query strings never carry the token, but keep messages short.
    let mut message = err.to_string();
    if let Some(url) = err.url() {
        message = message.replace(url.as_str(), url.path());
    }
    message
}
