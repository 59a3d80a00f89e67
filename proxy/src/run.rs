//! Server startup.

use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use x402_treasurer::ReqwestWithPayments;
use x402_treasurer::ReqwestWithPaymentsBuild;

use crate::config::Config;
use crate::forward::{AppState, router};
use crate::session::SessionRegistry;
use crate::util::{SigDown, Telemetry};

/// Runs the proxy until SIGINT or SIGTERM.
///
/// - Loads `.env` variables.
/// - Installs logging, and OTLP export with the `telemetry` feature.
/// - Builds wallet, treasurer and payments middleware from the configuration.
/// - Serves the forwarding router on `HOST:PORT`.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;
    let payments = config.payments()?;
    tracing::info!(payer = %payments.authorizer().wallet().payer(), "Wallet ready");

    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .with_payments(payments)
        .build()?;
    let sessions = Arc::new(SessionRegistry::new(config.session_idle_timeout()));
    let state = Arc::new(AppState::new(
        http,
        config.target().cloned(),
        sessions.clone(),
    ));

    let sig_down = SigDown::try_new()?;
    let sweeper = sessions.spawn_sweeper(sig_down.cancellation_token());

    let http_endpoints = router(state);
    #[cfg(feature = "telemetry")]
    let http_endpoints = http_endpoints.layer(telemetry.http_tracing());
    let http_endpoints = http_endpoints.layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers(cors::Any)
            .expose_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!(name = telemetry.name(), version = telemetry.version(), "Starting proxy at http://{}", addr);
    match config.target() {
        Some(target) => tracing::info!(%target, "Default target"),
        None => tracing::info!("No default target, requests must pass ?target="),
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e))?;

    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    sig_down.recv().await;
    sweeper.await?;
    tracing::info!("Proxy stopped");
    Ok(())
}
