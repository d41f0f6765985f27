//! Schwab broker endpoints: OAuth flows, account reads, observability, and
//! the HITL-gated order surface.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppDeps;
use crate::trade_controls::{
    audit_trade_request, enforce_trade_submission_allowed, HitlApproval,
};

pub fn router() -> Router<Arc<AppDeps>> {
    Router::new()
        .route("/schwab/status", get(schwab_status))
        .route("/schwab/oauth/authorize-url", get(schwab_authorize_url))
        .route("/schwab/oauth/exchange", post(schwab_oauth_exchange))
        .route("/schwab/oauth/refresh", post(schwab_oauth_refresh))
        .route("/schwab/accounts", get(schwab_accounts))
        .route("/schwab/accounts/:account_number/positions", get(schwab_positions))
        .route("/schwab/orders", get(schwab_orders))
        .route("/schwab/accounts/:account_number/orders", get(schwab_account_orders))
        .route(
            "/schwab/accounts/:account_number/transactions",
            get(schwab_transactions),
        )
        .route("/schwab/user-preference", get(schwab_user_preference))
        .route("/schwab/observability", get(schwab_observability))
        .route(
            "/schwab/accounts/:account_number/orders/preview",
            post(schwab_preview_order),
        )
        .route(
            "/schwab/accounts/:account_number/orders/submit",
            post(schwab_submit_order),
        )
}

fn unavailable(deps: &AppDeps, detail: &str, app: &str) -> (StatusCode, String) {
    match deps.ring.last_error(app) {
        Some(last_error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{detail} Last error: {last_error}"),
        ),
        None => (StatusCode::SERVICE_UNAVAILABLE, detail.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizeUrlParams {
    #[serde(default = "default_scope")]
    scope: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default = "default_app")]
    app: String,
}

fn default_scope() -> String {
    "readonly".to_string()
}

fn default_app() -> String {
    "market".to_string()
}

#[derive(Debug, Deserialize)]
struct CodeExchangeRequest {
    code: String,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default = "default_app")]
    app: String,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_app")]
    app: String,
}

#[derive(Debug, Deserialize)]
struct MaxResultsParams {
    #[serde(default = "default_max_results")]
    max_results: u32,
}

fn default_max_results() -> u32 {
    100
}

#[derive(Debug, Deserialize)]
struct ObservabilityParams {
    #[serde(default = "default_obs_limit")]
    limit: usize,
}

fn default_obs_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
struct OrderSubmissionRequest {
    order: Value,
    #[serde(default)]
    hitl: Option<HitlApproval>,
}

async fn schwab_status(State(deps): State<Arc<AppDeps>>) -> Json<Value> {
    Json(deps.schwab.connection_status())
}

async fn schwab_authorize_url(
    Query(params): Query<AuthorizeUrlParams>,
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let status = deps.schwab.connection_status();
    let configured = status[params.app.as_str()]["configured"]
        .as_bool()
        .unwrap_or(false);
    if !configured {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Schwab {} app is not configured.", params.app),
        ));
    }
    let url = deps
        .schwab
        .build_authorize_url(&params.scope, params.state.as_deref(), &params.app);
    Ok(Json(json!({ "authorize_url": url })))
}

async fn schwab_oauth_exchange(
    State(deps): State<Arc<AppDeps>>,
    Json(request): Json<CodeExchangeRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let token = deps
        .schwab
        .exchange_auth_code_for_token(&request.code, request.redirect_uri.as_deref(), &request.app)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({
        "status": "ok",
        "token_saved": true,
        "expires_in": token.get("expires_in"),
        "app": request.app,
    })))
}

async fn schwab_oauth_refresh(
    State(deps): State<Arc<AppDeps>>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let token = deps
        .schwab
        .refresh_auth_token(request.refresh_token.as_deref(), &request.app)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({
        "status": "ok",
        "token_saved": true,
        "expires_in": token.get("expires_in"),
        "app": request.app,
    })))
}

async fn schwab_accounts(
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let accounts = deps.schwab.get_accounts(true).await.ok_or_else(|| {
        unavailable(&deps, "Schwab accounts unavailable. Check credentials/token.", "trader")
    })?;
    Ok(Json(json!({ "accounts": accounts })))
}

async fn schwab_positions(
    Path(account_number): Path<String>,
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let accounts = deps.schwab.get_accounts(true).await.ok_or_else(|| {
        unavailable(&deps, "Schwab accounts unavailable. Check credentials/token.", "trader")
    })?;
    for account in &accounts {
        let securities = account
            .get("securitiesAccount")
            .or_else(|| account.get("account"))
            .unwrap_or(account);
        let acct = securities
            .get("accountNumber")
            .or_else(|| securities.get("account_number"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if acct == account_number {
            return Ok(Json(json!({
                "account_number": account_number,
                "positions": securities.get("positions").cloned().unwrap_or(json!([])),
            })));
        }
    }
    Err((
        StatusCode::NOT_FOUND,
        format!("Account {account_number} not found in Schwab response."),
    ))
}

async fn schwab_orders(
    Query(params): Query<MaxResultsParams>,
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let orders = deps
        .schwab
        .get_all_orders(params.max_results.clamp(1, 1000))
        .await
        .ok_or_else(|| unavailable(&deps, "Schwab orders unavailable.", "trader"))?;
    Ok(Json(json!({ "orders": orders })))
}

async fn schwab_account_orders(
    Path(account_number): Path<String>,
    Query(params): Query<MaxResultsParams>,
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let orders = deps
        .schwab
        .get_account_orders(&account_number, params.max_results.clamp(1, 1000))
        .await
        .ok_or_else(|| unavailable(&deps, "Schwab account orders unavailable.", "trader"))?;
    Ok(Json(json!({ "account_number": account_number, "orders": orders })))
}

async fn schwab_transactions(
    Path(account_number): Path<String>,
    Query(params): Query<MaxResultsParams>,
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let transactions = deps
        .schwab
        .get_account_transactions(&account_number, params.max_results.clamp(1, 1000))
        .await
        .ok_or_else(|| unavailable(&deps, "Schwab transactions unavailable.", "trader"))?;
    Ok(Json(json!({
        "account_number": account_number,
        "transactions": transactions,
    })))
}

async fn schwab_user_preference(
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let prefs = deps
        .schwab
        .get_user_preferences()
        .await
        .ok_or_else(|| unavailable(&deps, "Schwab user preference unavailable.", "trader"))?;
    Ok(Json(prefs))
}

async fn schwab_observability(
    Query(params): Query<ObservabilityParams>,
    State(deps): State<Arc<AppDeps>>,
) -> Json<Value> {
    let snapshot = deps.ring.snapshot(params.limit.clamp(1, 200));
    Json(serde_json::to_value(snapshot).unwrap_or(json!({})))
}

async fn schwab_preview_order(
    Path(account_number): Path<String>,
    State(deps): State<Arc<AppDeps>>,
    Json(request): Json<OrderSubmissionRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    audit_trade_request(
        &deps.db,
        Some(&account_number),
        "preview",
        request.hitl.as_ref(),
        &request.order,
    );
    let preview = deps
        .schwab
        .preview_order(&account_number, &request.order)
        .await
        .ok_or_else(|| unavailable(&deps, "Schwab preview unavailable.", "trader"))?;
    Ok(Json(json!({ "account_number": account_number, "preview": preview })))
}

async fn schwab_submit_order(
    Path(account_number): Path<String>,
    State(deps): State<Arc<AppDeps>>,
    headers: HeaderMap,
    Json(request): Json<OrderSubmissionRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let secret = headers
        .get("x-hitl-secret")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    audit_trade_request(
        &deps.db,
        Some(&account_number),
        "submit_attempt",
        request.hitl.as_ref(),
        &request.order,
    );
    enforce_trade_submission_allowed(request.hitl.as_ref(), secret.as_deref()).map_err(|e| {
        (
            StatusCode::from_u16(e.status()).unwrap_or(StatusCode::FORBIDDEN),
            e.detail().to_string(),
        )
    })?;

    let result = deps
        .schwab
        .place_order(&account_number, &request.order)
        .await
        .ok_or_else(|| unavailable(&deps, "Schwab order submission failed.", "trader"))?;
    audit_trade_request(
        &deps.db,
        Some(&account_number),
        "submit_success",
        request.hitl.as_ref(),
        &request.order,
    );
    Ok(Json(json!({
        "account_number": account_number,
        "result": result,
        "status": "submitted",
    })))
}
