use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    Json,
};
use futures::stream::Stream;
use std::convert::Infallible;
use tokio_stream::{wrappers::WatchStream, StreamExt};
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::{AppError, Result},
    middleware::AuthUser,
    notification::{
        notification_dto::CreateNotificationRequest,
        notification_models::Notification,
        notification_reconciler::NotificationSnapshot,
    },
    state::AppState,
};

/// Commands only act on the session bound to the caller.
fn ensure_session(state: &AppState, user_id: Uuid) -> Result<()> {
    if state.session.current() == Some(user_id) {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "No active notification session for this user".to_string(),
        ))
    }
}

/// Current notification snapshot
#[utoipa::path(
    get,
    path = "/api/notifications",
    responses(
        (status = 200, description = "Notification snapshot", body = NotificationSnapshot),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "No active session for this user")
    ),
    tag = "notifications",
    security(("bearer_auth" = []))
)]
pub async fn get_notifications(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<NotificationSnapshot>> {
    ensure_session(&state, user_id)?;

    Ok(Json(state.reconciler.snapshot()))
}

/// Snapshot feed via Server-Sent Events
#[utoipa::path(
    get,
    path = "/api/notifications/stream",
    params(
        ("access_token" = Option<String>, Query, description = "Bearer token for clients that cannot set headers")
    ),
    responses(
        (status = 200, description = "SSE stream of notification snapshots"),
        (status = 401, description = "Unauthorized")
    ),
    tag = "notifications",
    security(("bearer_auth" = []))
)]
pub async fn notification_stream(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.reconciler.watch()).filter_map(move |snapshot| {
        // An unbound snapshot tells the client to clear its list.
        if snapshot.user_id.is_some() && snapshot.user_id != Some(user_id) {
            return None;
        }
        let json = serde_json::to_string(&snapshot).ok()?;
        Some(Ok(Event::default().event("snapshot").data(json)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Mark notification as read
#[utoipa::path(
    patch,
    path = "/api/notifications/{id}/read",
    params(
        ("id" = Uuid, Path, description = "Notification ID")
    ),
    responses(
        (status = 202, description = "Marked read locally, persisting", body = NotificationSnapshot),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "No active session for this user")
    ),
    tag = "notifications",
    security(("bearer_auth" = []))
)]
pub async fn mark_notification_read(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(notification_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    ensure_session(&state, user_id)?;

    state.reconciler.mark_as_read(notification_id);

    Ok((StatusCode::ACCEPTED, Json(state.reconciler.snapshot())))
}

/// Mark every notification as read
#[utoipa::path(
    post,
    path = "/api/notifications/read-all",
    responses(
        (status = 202, description = "Marked read locally, persisting", body = NotificationSnapshot),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "No active session for this user")
    ),
    tag = "notifications",
    security(("bearer_auth" = []))
)]
pub async fn mark_all_notifications_read(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<impl IntoResponse> {
    ensure_session(&state, user_id)?;

    state.reconciler.mark_all_as_read();

    Ok((StatusCode::ACCEPTED, Json(state.reconciler.snapshot())))
}

/// Delete a notification
#[utoipa::path(
    delete,
    path = "/api/notifications/{id}",
    params(
        ("id" = Uuid, Path, description = "Notification ID")
    ),
    responses(
        (status = 202, description = "Removed locally, persisting", body = NotificationSnapshot),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "No active session for this user")
    ),
    tag = "notifications",
    security(("bearer_auth" = []))
)]
pub async fn delete_notification(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(notification_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    ensure_session(&state, user_id)?;

    state.reconciler.delete_notification(notification_id);

    Ok((StatusCode::ACCEPTED, Json(state.reconciler.snapshot())))
}

/// Reload notifications from the backend
#[utoipa::path(
    post,
    path = "/api/notifications/refresh",
    responses(
        (status = 200, description = "Reloaded snapshot", body = NotificationSnapshot),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "No active session for this user")
    ),
    tag = "notifications",
    security(("bearer_auth" = []))
)]
pub async fn refresh_notifications(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<NotificationSnapshot>> {
    ensure_session(&state, user_id)?;

    state.reconciler.refresh().await;

    Ok(Json(state.reconciler.snapshot()))
}

/// Create a notification for the authenticated user
#[utoipa::path(
    post,
    path = "/api/notifications",
    request_body = CreateNotificationRequest,
    responses(
        (status = 201, description = "Notification created", body = Notification),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "Backend unavailable")
    ),
    tag = "notifications",
    security(("bearer_auth" = []))
)]
pub async fn create_notification(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreateNotificationRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;

    // Reaches the local store through the live subscription, not directly.
    let notification: Notification = state.gateway.create(payload.into_new(user_id)).await?;
    tracing::info!(notification_id = %notification.id, %user_id, "Notification created");

    Ok((StatusCode::CREATED, Json(notification)))
}
