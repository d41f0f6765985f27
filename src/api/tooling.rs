//! Tool contract introspection endpoints.

use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;

use crate::state::AppDeps;
use crate::tools;

pub fn router() -> Router<Arc<AppDeps>> {
    Router::new()
        .route("/tools/contracts", get(tool_contracts))
        .route("/tools/contracts/:tool_name", get(tool_contract))
}

async fn tool_contracts() -> Json<Value> {
    Json(tools::list_tool_contracts())
}

async fn tool_contract(Path(tool_name): Path<String>) -> Result<Json<Value>, (StatusCode, String)> {
    tools::get_tool_contract(&tool_name)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown tool: {tool_name}")))
}
