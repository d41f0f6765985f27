//! Report orchestration: effective prompt, builder run, synthesis, quality
//! gate with repair, thread lifecycle, and trace logging.

use std::time::Instant;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tracing::warn;

use crate::db::thread_repo;
use crate::reports::engine::generate_report;
use crate::reports::synthesizer::synthesize_report_markdown;
use crate::reports::templates;
use crate::state::AppDeps;

pub const QUALITY_PASS_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, Default)]
pub struct ReportRunOptions {
    pub owner_key: Option<String>,
    pub prompt_override: Option<String>,
    pub thread_id: Option<String>,
    pub follow_up_question: Option<String>,
    pub refresh_data: bool,
}

#[derive(Debug, Clone)]
pub struct ReportQuality {
    pub score: f64,
    pub checks: Vec<(&'static str, bool)>,
    pub warnings: Vec<String>,
}

impl ReportQuality {
    pub fn passed(&self) -> bool {
        self.score >= QUALITY_PASS_THRESHOLD
    }

    fn check(&self, name: &str) -> bool {
        self.checks
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
            .unwrap_or(false)
    }

    pub fn to_json(&self) -> Value {
        let checks: serde_json::Map<String, Value> = self
            .checks
            .iter()
            .map(|(name, ok)| (name.to_string(), json!(ok)))
            .collect();
        json!({
            "score": self.score,
            "checks": checks,
            "warnings": self.warnings,
        })
    }
}

/// Weighted checklist over the generated report. Weights sum to 1.0.
pub fn score_quality(report: &Value, payload: &Value) -> ReportQuality {
    let markdown = report.get("markdown").and_then(|v| v.as_str()).unwrap_or("");
    let report_type = report.get("report_type").and_then(|v| v.as_str()).unwrap_or("");
    let array_len = |key: &str| {
        report
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0)
    };
    let ticker = payload
        .get("ticker")
        .or_else(|| payload.get("symbol"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_uppercase();

    let type_token: String = report_type.replace('_', " ").chars().take(8).collect();
    let checks: Vec<(&'static str, bool)> = vec![
        ("has_markdown", markdown.trim().len() > 120),
        ("has_sources", array_len("sources_used") > 0),
        ("has_tool_plan", array_len("tool_plan") > 0),
        ("has_assumptions", array_len("assumptions") > 0),
        ("has_limitations", array_len("limitations") > 0),
        (
            "mentions_report_type",
            markdown.to_lowercase().contains(&type_token.to_lowercase()),
        ),
        (
            "mentions_ticker",
            ticker.is_empty() || markdown.to_uppercase().contains(&ticker),
        ),
    ];

    let weights: &[(&str, f64)] = &[
        ("has_markdown", 0.30),
        ("has_sources", 0.15),
        ("has_tool_plan", 0.15),
        ("has_assumptions", 0.10),
        ("has_limitations", 0.10),
        ("mentions_report_type", 0.10),
        ("mentions_ticker", 0.10),
    ];
    let score: f64 = checks
        .iter()
        .filter(|(_, ok)| *ok)
        .map(|(name, _)| weights.iter().find(|(n, _)| n == name).map(|(_, w)| *w).unwrap_or(0.0))
        .sum();
    let warnings = checks
        .iter()
        .filter(|(_, ok)| !*ok)
        .map(|(name, _)| name.to_string())
        .collect();

    ReportQuality {
        score: (score * 1000.0).round() / 1000.0,
        checks,
        warnings,
    }
}

/// Insert default sentences / fallback sources for every failing check.
/// Repair is monotonic: no passing check is ever weakened.
pub fn repair_if_needed(report: &Value, quality: &ReportQuality) -> Value {
    let mut repaired = report.clone();
    if !quality.check("has_assumptions") {
        repaired["assumptions"] =
            json!(["Model assumptions are estimated from available market and fundamentals data."]);
    }
    if !quality.check("has_limitations") {
        repaired["limitations"] =
            json!(["Some report sections use proxy metrics where direct datasets are unavailable."]);
    }
    if !quality.check("has_sources") {
        repaired["sources_used"] = json!(["market_data_provider", "finviz"]);
    }
    if !quality.check("has_tool_plan") {
        repaired["tool_plan"] = json!([{"tool": "report_engine", "reason": "Fallback tool plan"}]);
    }
    repaired
}

fn ensure_thread(
    deps: &AppDeps,
    owner_key: &str,
    report_type: &str,
    payload: &Value,
    effective_prompt: &str,
    result: &Value,
    thread_id: Option<&str>,
) -> Option<String> {
    let create = || {
        thread_repo::create_thread(&deps.db, owner_key, report_type, payload, effective_prompt, result)
            .map(|t| t.id)
            .map_err(|e| warn!(error = %e, "thread creation failed"))
            .ok()
    };
    match thread_id {
        None => create(),
        Some(id) => match thread_repo::get_thread(&deps.db, id, Some(owner_key)) {
            Ok(Some(existing)) => Some(existing.id),
            Ok(None) => create(),
            Err(e) => {
                warn!(thread_id = id, error = %e, "error checking thread, creating new one");
                create()
            }
        },
    }
}

/// Full orchestration for a fresh report run.
pub async fn orchestrate_report(
    deps: &AppDeps,
    report_type: &str,
    payload: &Value,
    options: ReportRunOptions,
) -> Result<Value> {
    let started = Instant::now();
    let mut trace: Vec<Value> = Vec::new();

    let effective_prompt = templates::effective_prompt(
        &deps.db,
        report_type,
        options.owner_key.as_deref(),
        options.prompt_override.as_deref(),
    )?;

    trace.push(json!({"phase": "plan", "status": "ok", "details": "Selected report builder and tool plan."}));
    let mut result = generate_report(deps, report_type, payload, Some(&effective_prompt)).await?;
    trace.push(json!({"phase": "generate", "status": "ok", "details": "Primary report generation complete."}));

    let synthesis = synthesize_report_markdown(
        &result,
        &effective_prompt,
        options.follow_up_question.as_deref(),
        &[],
    );
    result["markdown"] = json!(synthesis.markdown);
    trace.push(synthesis.trace);

    let quality = score_quality(&result, payload);
    trace.push(json!({
        "phase": "quality_gate",
        "status": if quality.passed() { "ok" } else { "warn" },
        "details": {"score": quality.score, "warnings": quality.warnings},
    }));

    let mut final_result = repair_if_needed(&result, &quality);
    let generation_ms = started.elapsed().as_millis() as u64;

    let mut thread_id = options.thread_id.clone();
    if let Some(ref owner) = options.owner_key {
        thread_id = ensure_thread(
            deps,
            owner,
            report_type,
            payload,
            &effective_prompt,
            &final_result,
            thread_id.as_deref(),
        );
        if let Some(ref id) = thread_id {
            let markdown = final_result.get("markdown").and_then(|v| v.as_str()).unwrap_or("");
            if let Err(e) = thread_repo::append_thread_message(
                &deps.db,
                id,
                "assistant",
                markdown,
                &json!({"event": "initial_report", "report_type": report_type}),
            ) {
                warn!(error = %e, "failed to append initial report message");
            }
        }
    }

    let tracker_result = deps.tracker.log_report_run(
        report_type,
        payload,
        &final_result,
        generation_ms,
        quality.score,
        &json!({
            "owner_key": options.owner_key.clone().unwrap_or_default(),
            "thread_id": thread_id.clone().unwrap_or_default(),
            "used_prompt_override": options.prompt_override.is_some(),
            "refresh_data": options.refresh_data,
            "report_type": report_type,
        }),
    );
    trace.push(json!({
        "phase": "trace_log",
        "status": if tracker_result.error.is_none() { "ok" } else { "warn" },
        "details": {
            "enabled": tracker_result.enabled,
            "run_id": tracker_result.run_id,
            "error": tracker_result.error,
        },
    }));

    final_result["quality_gate"] = quality.to_json();
    final_result["orchestration_trace"] = json!(trace);
    final_result["generation_ms"] = json!(generation_ms);
    final_result["effective_prompt"] = json!(effective_prompt);
    final_result["thread_id"] = json!(thread_id);
    final_result["follow_up_supported"] = json!(true);
    if let Some(run_id) = tracker_result.run_id {
        final_result["trace_run_id"] = json!(run_id);
    }
    Ok(final_result)
}

/// Follow-up turn on an existing report thread.
pub async fn orchestrate_report_followup(
    deps: &AppDeps,
    report_type: &str,
    owner_key: &str,
    thread_id: &str,
    question: &str,
    refresh_data: bool,
) -> Result<Value> {
    if owner_key.trim().is_empty() {
        bail!("owner_key is required for report follow-up.");
    }
    if thread_id.trim().is_empty() {
        bail!("thread_id is required for report follow-up.");
    }
    if question.trim().is_empty() {
        bail!("question is required for report follow-up.");
    }

    let started = Instant::now();
    let mut trace: Vec<Value> = vec![json!({
        "phase": "followup_plan",
        "status": "ok",
        "details": {"thread_id": thread_id, "refresh_data": refresh_data},
    })];

    let Some(thread) = thread_repo::get_thread(&deps.db, thread_id, Some(owner_key))? else {
        bail!("Report thread not found for this owner.");
    };
    if thread.report_type.to_lowercase() != report_type.trim().to_lowercase() {
        bail!("Thread report type does not match endpoint report type.");
    }

    let base_payload = thread.base_payload.clone();
    let effective_prompt = thread.effective_prompt.clone();

    thread_repo::append_thread_message(
        &deps.db,
        thread_id,
        "user",
        question,
        &json!({"event": "followup"}),
    )?;

    let mut working_report = thread.latest_report.clone();
    if refresh_data {
        working_report =
            generate_report(deps, report_type, &base_payload, Some(&effective_prompt)).await?;
        trace.push(json!({"phase": "generate_refresh", "status": "ok", "details": "Refreshed deterministic report data."}));
    }

    let thread_messages: Vec<Value> = thread_repo::list_thread_messages(&deps.db, thread_id, 40)?
        .into_iter()
        .filter_map(|m| serde_json::to_value(m).ok())
        .collect();
    let synthesis = synthesize_report_markdown(
        &working_report,
        &effective_prompt,
        Some(question),
        &thread_messages,
    );
    working_report["markdown"] = json!(synthesis.markdown);
    trace.push(synthesis.trace);

    let quality = score_quality(&working_report, &base_payload);
    let mut final_result = repair_if_needed(&working_report, &quality);
    thread_repo::update_thread_latest_report(&deps.db, thread_id, &final_result)?;
    let markdown = final_result.get("markdown").and_then(|v| v.as_str()).unwrap_or("");
    thread_repo::append_thread_message(
        &deps.db,
        thread_id,
        "assistant",
        markdown,
        &json!({"event": "followup_response"}),
    )?;

    let generation_ms = started.elapsed().as_millis() as u64;
    let tracker_result = deps.tracker.log_report_run(
        report_type,
        &base_payload,
        &final_result,
        generation_ms,
        quality.score,
        &json!({
            "owner_key": owner_key,
            "thread_id": thread_id,
            "used_prompt_override": false,
            "refresh_data": refresh_data,
            "report_type": report_type,
            "follow_up": true,
        }),
    );
    trace.push(json!({
        "phase": "trace_log",
        "status": if tracker_result.error.is_none() { "ok" } else { "warn" },
        "details": {
            "enabled": tracker_result.enabled,
            "run_id": tracker_result.run_id,
            "error": tracker_result.error,
        },
    }));

    final_result["quality_gate"] = quality.to_json();
    final_result["orchestration_trace"] = json!(trace);
    final_result["generation_ms"] = json!(generation_ms);
    final_result["effective_prompt"] = json!(effective_prompt);
    final_result["thread_id"] = json!(thread_id);
    final_result["follow_up_supported"] = json!(true);
    final_result["follow_up_question"] = json!(question);
    if let Some(run_id) = tracker_result.run_id {
        final_result["trace_run_id"] = json!(run_id);
    }
    Ok(final_result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_report() -> Value {
        json!({
            "report_type": "citadel_technical",
            "markdown": format!("# Citadel Technical Report Card: PLTR\n{}", "x".repeat(150)),
            "sources_used": ["market_data_provider"],
            "tool_plan": [{"tool": "market_data.quote"}],
            "assumptions": ["a"],
            "limitations": ["l"],
        })
    }

    #[test]
    fn full_report_scores_high() {
        let quality = score_quality(&full_report(), &json!({"ticker": "PLTR"}));
        assert!(quality.passed());
        assert!((quality.score - 1.0).abs() < 1e-9);
        assert!(quality.warnings.is_empty());
    }

    #[test]
    fn missing_sections_lower_score() {
        let report = json!({
            "report_type": "citadel_technical",
            "markdown": "short",
        });
        let quality = score_quality(&report, &json!({"ticker": "PLTR"}));
        assert!(!quality.passed());
        assert!(quality.warnings.contains(&"has_markdown".to_string()));
        assert!(quality.warnings.contains(&"has_sources".to_string()));
        assert!(quality.warnings.contains(&"mentions_ticker".to_string()));
    }

    #[test]
    fn missing_ticker_in_payload_passes_ticker_check() {
        let quality = score_quality(&full_report(), &json!({}));
        assert!(quality.check("mentions_ticker"));
    }

    #[test]
    fn repair_is_monotonic() {
        let report = json!({
            "report_type": "citadel_technical",
            "markdown": format!("# Citadel technical for PLTR\n{}", "x".repeat(150)),
        });
        let payload = json!({"ticker": "PLTR"});
        let before = score_quality(&report, &payload);
        let repaired = repair_if_needed(&report, &before);
        let after = score_quality(&repaired, &payload);

        // Every repairable failing check flips to true and the score never
        // decreases.
        for name in ["has_sources", "has_tool_plan", "has_assumptions", "has_limitations"] {
            assert!(after.check(name), "{name} should pass after repair");
        }
        assert!(after.score >= before.score);

        // Repairing an already-complete report changes nothing.
        let complete = full_report();
        let q = score_quality(&complete, &payload);
        assert_eq!(repair_if_needed(&complete, &q), complete);
    }

    #[tokio::test]
    async fn followup_validates_inputs() {
        let deps = crate::state::AppDeps::for_tests();
        let err = orchestrate_report_followup(&deps, "citadel_technical", "", "t", "q", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("owner_key"));
        let err = orchestrate_report_followup(&deps, "citadel_technical", "o", "", "q", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("thread_id"));
        let err = orchestrate_report_followup(&deps, "citadel_technical", "o", "t", " ", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("question"));
    }

    #[tokio::test]
    async fn followup_requires_matching_thread() {
        let deps = crate::state::AppDeps::for_tests();
        let thread = thread_repo::create_thread(
            &deps.db,
            "owner-1",
            "goldman_screener",
            &json!({"limit": 5}),
            "prompt",
            &full_report(),
        )
        .unwrap();

        // Wrong owner.
        let err = orchestrate_report_followup(
            &deps, "goldman_screener", "owner-2", &thread.id, "what changed?", false,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not found"));

        // Wrong report type for the thread.
        let err = orchestrate_report_followup(
            &deps, "morgan_dcf", "owner-1", &thread.id, "what changed?", false,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[tokio::test]
    async fn followup_appends_exactly_two_messages() {
        let deps = crate::state::AppDeps::for_tests();
        let thread = thread_repo::create_thread(
            &deps.db,
            "owner-1",
            "blackrock_builder",
            &json!({"risk_tolerance": "moderate"}),
            "prompt",
            &json!({"report_type": "blackrock_builder", "markdown": "# BlackRock plan"}),
        )
        .unwrap();
        let before = thread_repo::list_thread_messages(&deps.db, &thread.id, 40)
            .unwrap()
            .len();

        // refresh_data re-runs the builder from the stored base payload;
        // blackrock_builder needs no network so this runs offline.
        let result = orchestrate_report_followup(
            &deps,
            "blackrock_builder",
            "owner-1",
            &thread.id,
            "What if I go aggressive?",
            true,
        )
        .await
        .unwrap();

        let messages = thread_repo::list_thread_messages(&deps.db, &thread.id, 40).unwrap();
        assert_eq!(messages.len(), before + 2);
        assert_eq!(messages[messages.len() - 2].role, "user");
        assert_eq!(messages[messages.len() - 1].role, "assistant");
        assert_eq!(result["follow_up_question"], "What if I go aggressive?");
        assert!(result["markdown"]
            .as_str()
            .unwrap()
            .starts_with("**Follow-up Analysis:**"));

        let updated = thread_repo::get_thread(&deps.db, &thread.id, Some("owner-1"))
            .unwrap()
            .unwrap();
        assert_eq!(updated.latest_report["report_type"], "blackrock_builder");
    }

    #[tokio::test]
    async fn orchestrate_creates_thread_and_gates_quality() {
        let deps = crate::state::AppDeps::for_tests();
        let result = orchestrate_report(
            &deps,
            "blackrock_builder",
            &json!({"risk_tolerance": "moderate"}),
            ReportRunOptions {
                owner_key: Some("owner-9".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let thread_id = result["thread_id"].as_str().unwrap();
        assert!(!thread_id.is_empty());
        assert!(result["quality_gate"]["score"].as_f64().unwrap() > 0.0);
        assert_eq!(result["follow_up_supported"], true);

        // Quality-gate failures repair rather than reject: the repaired
        // report always carries assumptions/limitations/sources.
        assert!(result["assumptions"].as_array().unwrap().len() > 0);
        assert!(result["limitations"].as_array().unwrap().len() > 0);
        assert!(result["sources_used"].as_array().unwrap().len() > 0);

        let messages = thread_repo::list_thread_messages(&deps.db, thread_id, 40).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "assistant");
    }
}
