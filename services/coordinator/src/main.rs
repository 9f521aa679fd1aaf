use coordinator::coordinator::CoordinatorRegistry;
use coordinator::kv::PgDurable;
use coordinator::state::AppState;
use coordinator::{build_router, db};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let web_domain = env::var("WEB_DOMAIN").unwrap_or_else(|_| "https://opencode.ai".to_owned());

    info!("connecting to database...");
    let pool = db::create_pool(&database_url)
        .await
        .expect("failed to connect to database");
    db::run_migrations(&pool).await.expect("failed to run migrations");
    info!("migrations applied");

    let durable = Arc::new(PgDurable::new(pool));
    let registry = Arc::new(CoordinatorRegistry::new(durable));
    let state = AppState::new(registry, web_domain);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "coordinator listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("coordinator shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
