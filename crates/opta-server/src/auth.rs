//! Bearer-token authentication for the HTTP and WebSocket surfaces.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use opta_core::errors::DaemonError;

use crate::error::ApiError;
use crate::server::AppState;

pub struct AuthToken(SecretString);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// 32 random bytes, hex encoded.
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        Self::new(hex::encode(bytes))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Constant-time comparison.
    pub fn verify(&self, presented: &str) -> bool {
        let expected = self.0.expose_secret().as_bytes();
        expected.ct_eq(presented.as_bytes()).into()
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// The token of an `Authorization: Bearer <token>` header.
pub fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match bearer(request.headers()) {
        Some(token) if state.token.verify(token) => Ok(next.run(request).await),
        Some(_) => Err(DaemonError::Auth("invalid token".into()).into()),
        None => Err(DaemonError::Auth("missing bearer token".into()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn verify_matches_only_the_exact_token() {
        let token = AuthToken::new("secret");
        assert!(token.verify("secret"));
        assert!(!token.verify("secreT"));
        assert!(!token.verify("secret2"));
        assert!(!token.verify(""));
        assert!(!token.verify("secre"));
    }

    #[test]
    fn generated_token_verifies_against_itself() {
        let token = AuthToken::generate();
        let copy = token.expose().to_string();
        assert!(token.verify(&copy));
        assert!(hex::decode(&copy).is_ok_and(|raw| raw.len() == 32));
    }

    #[test]
    fn generated_tokens_are_distinct_hex() {
        let a = AuthToken::generate();
        let b = AuthToken::generate();
        assert_eq!(a.expose().len(), 64);
        assert!(a.expose().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.expose(), b.expose());
        assert_eq!(format!("{a:?}"), "AuthToken(<redacted>)");
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer(&headers), Some("abc"));
    }
}
