use std::convert::Infallible;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::repo::StoreError;
use super::repo_types::{Scope, User};
use super::tokens::validate_token_plaintext;
use crate::error::AppError;
use crate::state::AppState;
use crate::validator::Validator;

/// Who is making the request. Placed in request extensions by [`authenticate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Anonymous,
    Authenticated(User),
}

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }
}

/// Resolves the bearer token in `Authorization`, if any, to an identity.
pub(crate) async fn resolve_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, AppError> {
    let mut values = headers.get_all(header::AUTHORIZATION).iter();
    let Some(value) = values.next() else {
        return Ok(Identity::Anonymous);
    };
    if values.next().is_some() {
        warn!("multiple Authorization headers");
        return Err(AppError::InvalidAuthenticationHeader);
    }

    // Expect "Bearer <token>"
    let value = value
        .to_str()
        .map_err(|_| AppError::InvalidAuthenticationHeader)?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or(AppError::InvalidAuthenticationHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() || token.contains(' ') {
        return Err(AppError::InvalidAuthenticationHeader);
    }

    let mut v = Validator::new();
    validate_token_plaintext(&mut v, "token", token);
    if !v.is_valid() {
        return Err(AppError::InvalidOrExpiredToken);
    }

    match state.tokens.lookup_user(Scope::Authentication, token).await {
        Ok(user) => {
            debug!(user_id = %user.id, "request authenticated");
            Ok(Identity::Authenticated(user))
        }
        Err(StoreError::NotFound) => {
            warn!("invalid or expired token");
            Err(AppError::InvalidOrExpiredToken)
        }
        Err(e) => Err(e.into()),
    }
}

/// Middleware binding an [`Identity`] to every request before routing.
pub async fn authenticate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let mut res = match resolve_identity(&state, req.headers()).await {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    };
    res.headers_mut()
        .append(header::VARY, HeaderValue::from_static("Authorization"));
    res
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Identity>()
            .cloned()
            .unwrap_or(Identity::Anonymous))
    }
}

/// An authenticated, activated user. Anonymous callers get `Unauthorized`,
/// unactivated ones `Forbidden`.
pub struct ActivatedUser(pub User);

#[async_trait]
impl<S> FromRequestParts<S> for ActivatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let identity = match Identity::from_request_parts(parts, state).await {
            Ok(identity) => identity,
            Err(never) => match never {},
        };
        match identity {
            Identity::Anonymous => Err(AppError::Unauthorized),
            Identity::Authenticated(user) if !user.activated => Err(AppError::Forbidden),
            Identity::Authenticated(user) => Ok(ActivatedUser(user)),
        }
    }
}
