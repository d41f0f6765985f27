//! HTTP surface: streaming chat plus the REST routers.

pub mod market;
pub mod reports;
pub mod schwab;
pub mod stream;
pub mod tooling;

use std::sync::Arc;

use axum::Router;

use crate::state::AppDeps;

pub fn api_router() -> Router<Arc<AppDeps>> {
    Router::new()
        .merge(stream::router())
        .merge(market::router())
        .merge(reports::router())
        .merge(schwab::router())
        .merge(tooling::router())
}
