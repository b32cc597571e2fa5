// =============================================================================
// PHARMACY SERVICE - Main Entry Point
// =============================================================================
// Pharmacy locator and medicine reservation service:
// - Medicine search ranked by distance, with live stock availability
// - Reservation lifecycle with transactional stock decrement/restore
// - Cart staging (no stock commitment)
// - Prometheus metrics, Redis caching, structured JSON logs
// =============================================================================

mod auth;     // Gateway identity extraction (auth.rs)
mod clock;    // Injected time source (clock.rs)
mod config;   // Configuration loading (config.rs)
mod db;       // Database operations (db.rs)
mod error;    // Error types (error.rs)
mod geo;      // Haversine distance (geo.rs)
mod handlers; // HTTP request handlers (handlers.rs)
mod metrics;  // Prometheus metrics setup (metrics.rs)
mod models;   // Data structures (models.rs)
mod search;   // Proximity ranking (search.rs)

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::metrics::setup_metrics;

/// Shared state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub redis: redis::aio::ConnectionManager,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub clock: Clock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pharmacy_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Pharmacy Service...");

    let config = Config::from_env()?;
    info!(port = config.port, "Configuration loaded");

    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("Connected to Redis");

    let state = Arc::new(AppState {
        db,
        redis: redis_conn,
        metrics_handle,
        clock: Clock::System,
    });

    // Background expiry sweep. The read paths run the same settlement lazily,
    // so this only bounds how long an idle overdue reservation can hold stock.
    let sweep_state = state.clone();
    let sweep_interval = Duration::from_secs(config.expiry_sweep_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = handlers::settle_expired(&sweep_state).await {
                warn!(error = %err, "Expiry sweep failed");
            }
        }
    });
    info!(
        interval_secs = config.expiry_sweep_secs,
        "Reservation expiry sweep scheduled"
    );

    let app = Router::new()
        // ----- Health & Metrics -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Discovery -----
        .route("/api/v1/search", get(handlers::search_medicines))
        .route("/api/v1/nearby", get(handlers::nearby_pharmacies))
        .route("/api/v1/pharmacies/:id", get(handlers::pharmacy_detail))
        // ----- Reservations -----
        .route(
            "/api/v1/reservations",
            get(handlers::list_reservations).post(handlers::create_reservation),
        )
        .route(
            "/api/v1/reservations/stats",
            get(handlers::reservation_stats),
        )
        .route(
            "/api/v1/reservations/pharmacy",
            get(handlers::pharmacy_reservations),
        )
        .route("/api/v1/reservations/:id", get(handlers::get_reservation))
        .route(
            "/api/v1/reservations/:id/cancel",
            post(handlers::cancel_reservation),
        )
        .route(
            "/api/v1/reservations/:id/update_status",
            post(handlers::update_reservation_status),
        )
        // ----- Cart -----
        .route("/api/v1/cart", get(handlers::get_cart))
        .route("/api/v1/cart/items", post(handlers::add_cart_item))
        .route(
            "/api/v1/cart/items/:id",
            patch(handlers::update_cart_item).delete(handlers::remove_cart_item),
        )
        .route("/api/v1/cart/clear", post(handlers::clear_cart))
        .route("/api/v1/cart/complete", post(handlers::complete_cart))
        // ----- Middleware -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Pharmacy Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
