use crate::{
    notification::{
        self,
        notification_dto::CreateNotificationRequest,
        notification_models::{Notification, NotificationType},
        notification_reconciler::{NotificationSnapshot, ReconcilerPhase},
    },
    session::{self, session_dto::SessionResponse},
    state::AppState,
};
use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        session::session_handlers::create_session,
        session::session_handlers::delete_session,
        notification::notification_handlers::get_notifications,
        notification::notification_handlers::notification_stream,
        notification::notification_handlers::mark_notification_read,
        notification::notification_handlers::mark_all_notifications_read,
        notification::notification_handlers::delete_notification,
        notification::notification_handlers::refresh_notifications,
        notification::notification_handlers::create_notification,
    ),
    components(
        schemas(
            CreateNotificationRequest,
            SessionResponse,
            Notification,
            NotificationType,
            NotificationSnapshot,
            ReconcilerPhase,
        )
    ),
    tags(
        (name = "session", description = "Session binding endpoints"),
        (name = "notifications", description = "Notification endpoints")
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            )
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .nest("/session", session::routes::session_routes(state.clone()))
        .nest(
            "/notifications",
            notification::routes::notification_routes(state.clone()),
        );

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
