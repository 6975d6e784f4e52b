// =============================================================================
// Admin Token Gate — authentication for the control surface
// =============================================================================
//
// Every control endpoint takes an [`AdminToken`] extractor argument. It
// checks `Authorization: Bearer <token>` against the `XBT_ADMIN_TOKEN`
// environment variable and rejects the request before the handler body runs
// when the two disagree. Failures are typed in [`AuthError`] so the JSON
// error body and status code fall out of the variant.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::warn;

/// Environment variable holding the expected admin token. Read per request
/// so a rotated token takes effect without a restart.
const ADMIN_TOKEN_ENV: &str = "XBT_ADMIN_TOKEN";

/// Why a control request was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("admin token is not configured on the server")]
    NotConfigured,

    #[error("request carries no bearer token")]
    MissingBearer,

    #[error("admin token mismatch")]
    BadToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::MissingBearer | Self::BadToken => StatusCode::UNAUTHORIZED,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Proof that the caller presented the admin token. Carries no data; its
/// presence in a handler signature is what gates the endpoint.
pub struct AdminToken;

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminToken
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!(env = ADMIN_TOKEN_ENV, "admin token unset, refusing control request");
            return Err(AuthError::NotConfigured);
        }

        let presented = bearer_token(&parts.headers).ok_or_else(|| {
            warn!("control request without a bearer token");
            AuthError::MissingBearer
        })?;

        if !tokens_match(presented, &expected) {
            warn!("control request with a wrong admin token");
            return Err(AuthError::BadToken);
        }

        Ok(AdminToken)
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Token comparison whose cost does not depend on where the first
/// difference sits. The length difference and every byte-pair XOR are
/// folded into one accumulator that is inspected only at the end.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let p = presented.as_bytes();
    let e = expected.as_bytes();

    let mut diff = p.len() ^ e.len();
    for i in 0..p.len().min(e.len()) {
        diff |= usize::from(p[i] ^ e[i]);
    }
    diff == 0
}
