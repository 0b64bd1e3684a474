use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};

use crate::{middleware::auth_middleware, state::AppState};

use super::notification_handlers;

pub fn notification_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(notification_handlers::get_notifications)
                .post(notification_handlers::create_notification),
        )
        .route("/stream", get(notification_handlers::notification_stream))
        .route("/read-all", post(notification_handlers::mark_all_notifications_read))
        .route("/refresh", post(notification_handlers::refresh_notifications))
        .route("/:id/read", patch(notification_handlers::mark_notification_read))
        .route("/:id", delete(notification_handlers::delete_notification))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}
