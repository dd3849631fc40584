//! Bearer-token authentication for upgrades and admin routes.

use std::collections::HashMap;

use axum::extract::FromRef;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use tracing::error;

use crate::services::store::{Account, Identity};
use crate::state::AppState;

/// Pull the session token from `?token=` or an `Authorization: Bearer` header.
/// The query parameter wins because browsers cannot set headers on upgrades.
#[must_use]
pub fn request_token(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params.get("token").filter(|t| !t.is_empty()) {
        return Some(token.clone());
    }
    bearer_token(headers).map(str::to_owned)
}

#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve a token to an account.
///
/// # Errors
///
/// `401` for an unknown token, `500` if the identity service fails.
pub async fn authenticate(identity: &dyn Identity, token: &str) -> Result<Account, StatusCode> {
    match identity.verify(token).await {
        Ok(Some(account)) => Ok(account),
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(e) => {
            error!(error = %e, "auth: token verification failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated account extracted from the bearer token.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub account: Account,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(StatusCode::UNAUTHORIZED)?;
        let app_state = AppState::from_ref(state);
        let account = authenticate(app_state.identity.as_ref(), token).await?;
        Ok(Self { account })
    }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
