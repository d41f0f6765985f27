//! Report endpoints: runs, follow-ups, types, and template overrides.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::reports::engine::list_report_types;
use crate::reports::orchestrator::{orchestrate_report, orchestrate_report_followup, ReportRunOptions};
use crate::reports::prompts::get_template;
use crate::reports::templates;
use crate::state::AppDeps;

pub fn router() -> Router<Arc<AppDeps>> {
    Router::new()
        .route("/reports/types", get(get_report_types))
        .route("/reports/templates", get(get_report_templates))
        .route(
            "/reports/templates/:report_type",
            put(update_report_template).delete(delete_report_template),
        )
        .route("/reports/:report_type/prompt", get(get_report_prompt))
        .route("/reports/:report_type", post(run_report))
        .route("/reports/:report_type/followup", post(followup_report))
}

#[derive(Debug, Deserialize)]
struct ReportRequest {
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    owner_key: Option<String>,
    #[serde(default)]
    prompt_override: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    follow_up_question: Option<String>,
    #[serde(default)]
    refresh_data: bool,
}

#[derive(Debug, Deserialize)]
struct TemplateUpdateRequest {
    owner_key: String,
    prompt_text: String,
}

#[derive(Debug, Deserialize)]
struct FollowupRequest {
    owner_key: String,
    thread_id: String,
    question: String,
    #[serde(default)]
    refresh_data: bool,
}

#[derive(Debug, Deserialize)]
struct OwnerKeyQuery {
    owner_key: String,
}

fn bad_request(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, e.to_string())
}

async fn get_report_types() -> Json<Value> {
    Json(json!({ "types": list_report_types() }))
}

async fn get_report_templates(
    Query(params): Query<OwnerKeyQuery>,
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let templates = templates::list_templates(&deps.db, &params.owner_key).map_err(bad_request)?;
    Ok(Json(json!({ "templates": templates })))
}

async fn update_report_template(
    Path(report_type): Path<String>,
    State(deps): State<Arc<AppDeps>>,
    Json(request): Json<TemplateUpdateRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    templates::save_template_override(&deps.db, &request.owner_key, &report_type, &request.prompt_text)
        .map(Json)
        .map_err(bad_request)
}

async fn delete_report_template(
    Path(report_type): Path<String>,
    Query(params): Query<OwnerKeyQuery>,
    State(deps): State<Arc<AppDeps>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    templates::reset_template_override(&deps.db, &params.owner_key, &report_type)
        .map(Json)
        .map_err(bad_request)
}

async fn get_report_prompt(
    Path(report_type): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let template = get_template(&report_type).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("Unknown report type '{report_type}'."),
        )
    })?;
    Ok(Json(json!({
        "id": template.id,
        "title": template.title,
        "prompt_template": template.prompt,
    })))
}

async fn run_report(
    Path(report_type): Path<String>,
    State(deps): State<Arc<AppDeps>>,
    Json(request): Json<ReportRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let options = ReportRunOptions {
        owner_key: request.owner_key,
        prompt_override: request.prompt_override,
        thread_id: request.thread_id,
        follow_up_question: request.follow_up_question,
        refresh_data: request.refresh_data,
    };
    orchestrate_report(&deps, &report_type, &request.payload, options)
        .await
        .map(Json)
        .map_err(|e| {
            let text = e.to_string();
            if text.contains("Unknown report type") || text.contains("is required") {
                (StatusCode::BAD_REQUEST, text)
            } else {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to generate report: {text}"),
                )
            }
        })
}

async fn followup_report(
    Path(report_type): Path<String>,
    State(deps): State<Arc<AppDeps>>,
    Json(request): Json<FollowupRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    orchestrate_report_followup(
        &deps,
        &report_type,
        &request.owner_key,
        &request.thread_id,
        &request.question,
        request.refresh_data,
    )
    .await
    .map(Json)
    .map_err(|e| {
        let text = e.to_string();
        if text.contains("required") || text.contains("not found") || text.contains("not match") {
            (StatusCode::BAD_REQUEST, text)
        } else {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to run follow-up: {text}"),
            )
        }
    })
}
