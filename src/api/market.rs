//! Direct market-data REST endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppDeps;
use crate::ta;

pub fn router() -> Router<Arc<AppDeps>> {
    Router::new()
        .route("/market/quote/:symbol", get(fetch_quote))
        .route("/market/history/:symbol", get(fetch_history))
        .route("/market/news/:symbol", get(fetch_news))
        .route("/market/movers", get(fetch_movers))
        .route("/market/profile/:symbol", get(fetch_profile))
        .route("/market/technicals/:symbol", get(fetch_technicals))
        .route("/market/hours", get(fetch_market_hours))
}

#[derive(Deserialize)]
struct HistoryParams {
    #[serde(default = "default_days")]
    days: u32,
}

fn default_days() -> u32 {
    30
}

#[derive(Deserialize)]
struct NewsParams {
    #[serde(default = "default_news_limit")]
    limit: usize,
}

fn default_news_limit() -> usize {
    5
}

#[derive(Deserialize)]
struct TechnicalParams {
    #[serde(default = "default_technical_days")]
    days: u32,
}

fn default_technical_days() -> u32 {
    180
}

async fn fetch_quote(
    Path(symbol): Path<String>,
    State(deps): State<Arc<AppDeps>>,
) -> Json<Value> {
    match deps.market.quote(&symbol).await {
        Some(quote) => Json(serde_json::to_value(quote).unwrap_or(Value::Null)),
        None => Json(json!({"symbol": symbol.to_uppercase(), "error": "No quote data available"})),
    }
}

async fn fetch_history(
    Path(symbol): Path<String>,
    Query(params): Query<HistoryParams>,
    State(deps): State<Arc<AppDeps>>,
) -> Json<Value> {
    let rows = deps.market.history(&symbol, params.days).await;
    Json(serde_json::to_value(rows).unwrap_or(json!([])))
}

async fn fetch_news(
    Path(symbol): Path<String>,
    Query(params): Query<NewsParams>,
    State(deps): State<Arc<AppDeps>>,
) -> Json<Value> {
    let news = deps.market.stock_news(Some(&symbol), params.limit).await;
    Json(serde_json::to_value(news).unwrap_or(json!([])))
}

async fn fetch_movers(State(deps): State<Arc<AppDeps>>) -> Json<Value> {
    Json(
        deps.market
            .movers()
            .await
            .unwrap_or_else(|| json!({"gainers": [], "losers": []})),
    )
}

async fn fetch_profile(
    Path(symbol): Path<String>,
    State(deps): State<Arc<AppDeps>>,
) -> Json<Value> {
    Json(deps.market.company_profile(&symbol).await)
}

async fn fetch_technicals(
    Path(symbol): Path<String>,
    Query(params): Query<TechnicalParams>,
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let history = deps.market.history(&symbol, params.days).await;
    let closes = ta::extract_closes(&history);
    match ta::analyze(&symbol, &closes) {
        Ok(snapshot) => Ok(Json(serde_json::to_value(snapshot).unwrap_or(Value::Null))),
        Err(e) => Err((StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    }
}

async fn fetch_market_hours(State(deps): State<Arc<AppDeps>>) -> Json<Value> {
    Json(deps.market.market_hours(&[]).await.unwrap_or(json!({})))
}
