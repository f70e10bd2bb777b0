use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::routers::error;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AdminAuthConfig {
    pub api_key: Option<String>,
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim());
        }
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
}

/// Length check is not constant-time; the byte comparison is.
fn keys_match(presented: &str, expected: &str) -> bool {
    let presented = presented.as_bytes();
    let expected = expected.as_bytes();
    presented.len() == expected.len() && presented.ct_eq(expected).unwrap_u8() == 1
}

/// Guards admin routes. With no admin key configured they are disabled outright.
pub async fn admin_auth_middleware(
    State(auth): State<AdminAuthConfig>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = auth.api_key.as_deref() else {
        return error::forbidden("admin_disabled", "Admin API is disabled: no admin key configured");
    };

    let verdict = presented_key(request.headers()).map(|key| keys_match(key, expected));
    match verdict {
        Some(true) => next.run(request).await,
        Some(false) => {
            warn!(path = %request.uri().path(), "Rejected admin request with invalid key");
            error::unauthorized("invalid_api_key", "Invalid admin API key")
        }
        None => error::unauthorized("missing_api_key", "Admin API key required"),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_keys_match() {
        assert!(keys_match("0123456789abcdef", "0123456789abcdef"));
        assert!(!keys_match("0123456789abcdeX", "0123456789abcdef"));
        assert!(!keys_match("short", "0123456789abcdef"));
    }

    #[test]
    fn test_presented_key_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(presented_key(&headers), None);

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(presented_key(&headers), Some("from-header"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        assert_eq!(presented_key(&headers), Some("from-bearer"));
    }
}
