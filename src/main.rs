//! StockPilot server: multi-specialist financial research backend.
//!
//! One process hosts the streaming chat pipeline (planner → scheduler →
//! specialists → aggregator), the report orchestrator, the broker surface,
//! and the shared provider/cache/persistence layer.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockpilot_backend::api::api_router;
use stockpilot_backend::cache::{close_cache, init_cache};
use stockpilot_backend::config::SETTINGS;
use stockpilot_backend::db::Database;
use stockpilot_backend::middleware::request_logging;
use stockpilot_backend::state::AppDeps;

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "ok"}))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stockpilot_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    // Prometheus scrape endpoint for the provider/report metrics.
    let metrics_addr: SocketAddr = format!("0.0.0.0:{}", SETTINGS.metrics_port)
        .parse()
        .context("parse metrics address")?;
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
    {
        warn!(error = %e, "metrics exporter not started");
    }

    init_cache();
    let db = Database::open(&SETTINGS.database_path)?;
    let deps = AppDeps::build(db)?;

    // Vector memory collection is created up front; a missing Qdrant just
    // degrades recalls to empty.
    deps.memory.ensure_collection().await;

    let origins: Vec<HeaderValue> = SETTINGS
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_router())
        .layer(axum::middleware::from_fn(request_logging))
        .layer(cors)
        .with_state(deps.clone());

    let addr: SocketAddr = format!("{}:{}", SETTINGS.host, SETTINGS.port)
        .parse()
        .context("parse listen address")?;
    info!(%addr, provider = %SETTINGS.market_data_provider, "🚀 StockPilot backend listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listen address")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    close_cache();
    info!("StockPilot backend stopped");
    Ok(())
}
