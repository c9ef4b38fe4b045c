use std::sync::Arc;

use axum::http::{Method, header};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use hydra_mcp::mcp::{DefaultTransportFactory, JsonFileStore, McpService};
use hydra_mcp::settings::Settings;
use hydra_mcp::state::AppState;

fn build_app(settings: &Settings) -> anyhow::Result<(axum::Router, AppState)> {
    let store = Arc::new(JsonFileStore::new(settings.config_path.clone()));
    let factory = Arc::new(DefaultTransportFactory::new(DefaultTransportFactory::default_http_client()?));
    let service = McpService::new(store, factory, settings.client.clone());
    let state = AppState::new(service);

    // The admin UI runs on a separate dev origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(86_400));

    let app = hydra_mcp::create_router(state.clone()).layer(cors).layer(
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
            )
        }),
    );

    Ok((app, state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let settings = Settings::from_env();
    let (app, state) = build_app(&settings)?;

    // Connections happen in the background; a broken server must not block startup.
    state.service.initialize().await?;
    state.mark_ready();

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!(
        "hydra-mcp listening on http://{} (configs: {})",
        addr,
        settings.config_path.display()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
