use anyhow::Context;
use legalpro_notifications::{
    routes::create_router,
    state::{AppState, Config, GatewaySettings},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,legalpro_notifications=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env().context("Invalid configuration")?;
    match &config.gateway {
        GatewaySettings::Supabase { url, .. } => {
            tracing::info!("Using Supabase notification backend at {}", url)
        }
        GatewaySettings::Memory => {
            tracing::warn!("Using in-memory notification backend; data is lost on restart")
        }
    }
    let addr = format!("{}:{}", config.host, config.port);

    let state = AppState::new(config);

    // Keep the reconciler scoped to whoever is logged in
    let follower = state.reconciler.follow(&state.session);

    let app = create_router(state.clone());

    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.session.logout();
    follower.abort();
    state.reconciler.teardown();
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {:?}", e);
        std::future::pending::<()>().await;
    }
}
