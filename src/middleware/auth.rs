use crate::{auth::verify_jwt, error::AppError, state::AppState};
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Query, State},
    http::{header, request::Parts, HeaderMap, Request, Uri},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

/// Supabase access token from the `Authorization` header, or from the
/// `access_token` query parameter for EventSource clients. The header wins.
pub(crate) fn bearer_token(headers: &HeaderMap, uri: &Uri) -> Result<String, AppError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        return value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
            .ok_or_else(|| AppError::Unauthorized("Malformed Authorization header".to_string()));
    }

    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(query)| query.access_token)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Missing access token".to_string()))
}

/// Verifies the caller's Supabase session and attaches its user id.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers(), req.uri())?;
    let user_id = verify_jwt(&token, &state.config.jwt_secret)?.user_id()?;
    tracing::trace!(%user_id, path = %req.uri().path(), "Authenticated request");

    req.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(req).await)
}

/// The authenticated Supabase user, placed by [`auth_middleware`].
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .copied()
            .ok_or_else(|| AppError::Unauthorized("Route is not behind auth_middleware".to_string()))
    }
}
