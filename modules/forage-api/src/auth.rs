use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ApiError;
use crate::AppState;

/// Proof that the request carried the admin bearer token. Extract this in every
/// `/admin` handler.
pub struct AdminAuth;

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let expected = state.config.admin_token.as_bytes();
        // An unset token locks the admin surface instead of opening it.
        if expected.is_empty() {
            return Err(ApiError::Unauthorized("admin access is not configured"));
        }
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized("missing bearer token"))?;
        if !token_matches(token.as_bytes(), expected) {
            return Err(ApiError::Unauthorized("invalid admin token"));
        }
        Ok(AdminAuth)
    }
}

/// `Authorization: Bearer <token>`, trimmed. None when absent or another scheme.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

type HmacSha256 = Hmac<Sha256>;

/// Compares HMAC-SHA256 tags of both tokens, keyed by the expected one, in
/// constant time via `Mac::verify_slice`.
pub fn token_matches(provided: &[u8], expected: &[u8]) -> bool {
    let tag = |input: &[u8]| {
        HmacSha256::new_from_slice(expected).map(|mut mac| {
            mac.update(input);
            mac
        })
    };
    match (tag(provided), tag(expected)) {
        (Ok(mac), Ok(reference)) => mac.verify_slice(&reference.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}
