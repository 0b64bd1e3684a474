use axum::{middleware, routing::post, Router};

use crate::{middleware::auth_middleware, state::AppState};

use super::session_handlers;

pub fn session_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/",
            post(session_handlers::create_session).delete(session_handlers::delete_session),
        )
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}
