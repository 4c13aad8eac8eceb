//! Bearer-token gate for the HTTP gateway.

use hyper::header::AUTHORIZATION;
use hyper::HeaderMap;

use crate::error::SupError;

/// Compare two byte strings without an early exit on the first difference.
/// Only the length is allowed to leak.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Holds the configured gateway secret. With no secret configured every
/// request is rejected.
#[derive(Clone)]
pub struct GatewayAuth {
    token: Option<String>,
}

impl std::fmt::Debug for GatewayAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayAuth")
            .field("configured", &self.token.is_some())
            .finish()
    }
}

impl GatewayAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), SupError> {
        let expected = self.token.as_deref().ok_or(SupError::Auth)?;
        let presented = bearer_token(headers).ok_or(SupError::Auth)?;
        if constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
            Ok(())
        } else {
            Err(SupError::Auth)
        }
    }
}

/// The token from `Authorization: Bearer <token>`, if well formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
