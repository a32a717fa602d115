pub mod error;
pub mod handlers;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::PaymentEngine;

/// Serve the command/query surface until `shutdown` flips to true.
pub async fn serve(
    engine: PaymentEngine,
    addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/payments", post(handlers::create_payment).get(handlers::list_payments))
        .route("/payments/{id}", get(handlers::get_payment))
        .route("/payments/{id}/release", post(handlers::release_payment))
        .route("/payments/{id}/cancel", post(handlers::cancel_payment))
        .route("/strategies/{id}/health", get(handlers::strategy_health))
        .layer(cors)
        .with_state(engine);

    println!("yield-rails API listening on {addr}");
    println!("  Create:  POST http://{addr}/payments");
    println!("  Release: POST http://{addr}/payments/{{id}}/release");
    println!("  Query:   GET  http://{addr}/payments/{{id}}");
    println!("  Health:  GET  http://{addr}/strategies/{{id}}/health");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("serving API")?;
    Ok(())
}
