use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::{
    error::{AppError, Result},
    middleware::AuthUser,
    state::AppState,
};

use super::session_dto::SessionResponse;

/// Bind the notification session to the authenticated user
#[utoipa::path(
    post,
    path = "/api/session",
    responses(
        (status = 202, description = "Session bound, notifications loading", body = SessionResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "session",
    security(("bearer_auth" = []))
)]
pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> impl IntoResponse {
    let rebound = state.session.login(user_id);

    (StatusCode::ACCEPTED, Json(SessionResponse { user_id, rebound }))
}

/// Unbind the notification session (logout)
#[utoipa::path(
    delete,
    path = "/api/session",
    responses(
        (status = 204, description = "Session unbound"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Session belongs to another user")
    ),
    tag = "session",
    security(("bearer_auth" = []))
)]
pub async fn delete_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<StatusCode> {
    match state.session.current() {
        Some(current) if current != user_id => Err(AppError::Forbidden(
            "Session belongs to another user".to_string(),
        )),
        _ => {
            state.session.logout();
            Ok(StatusCode::NO_CONTENT)
        }
    }
}
