//! Report engine: builder registry, tool-plan attachment, run persistence.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tracing::warn;

use crate::db::report_repo;
use crate::reports::helpers::{build_tool_plan, default_sources};
use crate::reports::prompts::{get_template, PROMPT_TEMPLATES};
use crate::reports::{portfolio, screening, technical, valuation};
use crate::state::AppDeps;

pub async fn generate_report(
    deps: &AppDeps,
    report_type: &str,
    payload: &Value,
    effective_prompt: Option<&str>,
) -> Result<Value> {
    let rt = report_type.trim().to_lowercase();
    let mut result = match rt.as_str() {
        "goldman_screener" => screening::build_goldman_screener(deps, payload).await?,
        "morgan_dcf" => valuation::build_morgan_dcf(deps, payload).await?,
        "bridgewater_risk" => portfolio::build_bridgewater_risk(deps, payload).await?,
        "jpm_earnings" => valuation::build_jpm_earnings(deps, payload).await?,
        "blackrock_builder" => portfolio::build_blackrock_builder(deps, payload).await?,
        "citadel_technical" => technical::build_citadel_technical(deps, payload).await?,
        "harvard_dividend" => screening::build_harvard_dividend(deps, payload).await?,
        "bain_competitive" => screening::build_bain_competitive(deps, payload).await?,
        "renaissance_pattern" => technical::build_renaissance_pattern(deps, payload).await?,
        "mckinsey_macro" => portfolio::build_mckinsey_macro(deps, payload).await?,
        _ => {
            let supported: Vec<&str> = PROMPT_TEMPLATES.iter().map(|t| t.id).collect();
            bail!(
                "Unknown report type '{report_type}'. Supported: {}",
                supported.join(", ")
            );
        }
    };

    result["tool_plan"] = json!(build_tool_plan(&rt, payload));
    if result.get("sources_used").is_none() {
        result["sources_used"] = json!(default_sources(&rt));
    }
    let template = get_template(&rt).expect("known report type");
    result["prompt_template"] = json!(template.prompt);
    result["effective_prompt"] = json!(effective_prompt.unwrap_or(template.prompt));

    match report_repo::save_report_run(&deps.db, &rt, payload, &result) {
        Ok(run_id) => {
            result["persisted_run_id"] = json!(run_id);
        }
        Err(e) => warn!(report_type = %rt, error = %e, "report run persistence failed"),
    }
    Ok(result)
}

pub fn list_report_types() -> Vec<Value> {
    PROMPT_TEMPLATES
        .iter()
        .map(|t| json!({"id": t.id, "title": t.title, "prompt_template": t.prompt}))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_listing_is_complete() {
        let types = list_report_types();
        assert_eq!(types.len(), 10);
        assert!(types.iter().any(|t| t["id"] == "citadel_technical"));
        assert!(types.iter().any(|t| t["id"] == "goldman_screener"));
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let deps = crate::state::AppDeps::for_tests();
        let err = generate_report(&deps, "lehman_special", &json!({}), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown report type"));
        assert!(err.to_string().contains("citadel_technical"));
    }

    #[tokio::test]
    async fn blackrock_report_carries_engine_fields() {
        // blackrock_builder needs no network access: a full engine pass runs
        // offline and exercises tool plan + persistence attachment.
        let deps = crate::state::AppDeps::for_tests();
        let report = generate_report(
            &deps,
            "blackrock_builder",
            &json!({"risk_tolerance": "moderate"}),
            Some("custom prompt"),
        )
        .await
        .unwrap();
        assert_eq!(report["report_type"], "blackrock_builder");
        assert_eq!(report["effective_prompt"], "custom prompt");
        assert!(report["prompt_template"].as_str().unwrap().contains("BlackRock"));
        assert!(report.get("persisted_run_id").is_some());
        assert!(report["tool_plan"].as_array().is_some());
        assert_eq!(report["sources_used"][0], "historical_allocation_proxies");
    }
}
