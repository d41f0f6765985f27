//! Local run tracker for chat turns and report runs.
//!
//! Stands in for an external experiment tracker: each run gets an id, a
//! compact parameter set, metrics, and artifacts, persisted to `trace_runs`.
//! Logging is best-effort and never surfaces errors to callers.

use serde_json::{json, Value};
use tracing::debug;

use crate::config::SETTINGS;
use crate::db::{report_repo, Database};

#[derive(Debug, Clone)]
pub struct TrackerRunResult {
    pub enabled: bool,
    pub run_id: Option<String>,
    pub error: Option<String>,
}

impl TrackerRunResult {
    fn disabled() -> Self {
        Self {
            enabled: false,
            run_id: None,
            error: None,
        }
    }
}

fn compact(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_len).collect();
    format!("{cut}...")
}

pub struct Tracker {
    db: Database,
}

impl Tracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn ui_url(&self) -> String {
        SETTINGS.tracker_ui_url.clone()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_report_run(
        &self,
        report_type: &str,
        payload: &Value,
        result: &Value,
        generation_ms: u64,
        quality_score: f64,
        trace: &Value,
    ) -> TrackerRunResult {
        if !SETTINGS.tracker_enabled {
            return TrackerRunResult::disabled();
        }
        let markdown_len = result
            .get("markdown")
            .and_then(|v| v.as_str())
            .map(|s| s.len())
            .unwrap_or(0);
        let params = json!({
            "report_type": report_type,
            "payload": compact(&payload.to_string(), 500),
            "has_ticker": payload.get("ticker").or_else(|| payload.get("symbol")).is_some(),
            "trace": trace,
        });
        let metrics_json = json!({
            "generation_ms": generation_ms,
            "quality_score": quality_score,
            "markdown_len": markdown_len,
            "sources_count": result.get("sources_used").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0),
            "tool_plan_count": result.get("tool_plan").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0),
        });
        let artifacts = json!({
            "report_markdown": result.get("markdown"),
            "report_data": result.get("data"),
            "assumptions": result.get("assumptions"),
            "limitations": result.get("limitations"),
        });

        metrics::histogram!("report_generation_ms", generation_ms as f64, "report_type" => report_type.to_string());
        metrics::histogram!("report_quality_score", quality_score, "report_type" => report_type.to_string());

        match report_repo::insert_trace_run(
            &self.db,
            "report",
            &format!("report:{report_type}"),
            &params,
            &metrics_json,
            &artifacts,
        ) {
            Ok(run_id) => TrackerRunResult {
                enabled: true,
                run_id: Some(run_id),
                error: None,
            },
            Err(e) => {
                debug!(error = %e, "report trace logging failed");
                TrackerRunResult {
                    enabled: true,
                    run_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_chat_trace(
        &self,
        user_query: &str,
        final_text: &str,
        events: &[Value],
        duration_ms: u64,
        route_agents: &[String],
        status: &str,
        error: Option<&str>,
    ) -> TrackerRunResult {
        if !SETTINGS.tracker_enabled {
            return TrackerRunResult::disabled();
        }
        let tool_events = events
            .iter()
            .filter(|e| {
                e.get("type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| t.starts_with("tool_"))
            })
            .count();
        let agent_events = events
            .iter()
            .filter(|e| {
                e.get("type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| t.starts_with("agent_"))
            })
            .count();

        let params = json!({
            "status": status,
            "route_agents": route_agents.join(" -> "),
            "user_query": compact(user_query, 500),
            "error": error.map(|e| compact(e, 500)),
        });
        let metrics_json = json!({
            "duration_ms": duration_ms,
            "event_count": events.len(),
            "agent_event_count": agent_events,
            "tool_event_count": tool_events,
            "final_chars": final_text.len(),
        });
        let artifacts = json!({
            "response": final_text,
            "events": events,
        });

        metrics::histogram!("chat_turn_duration_ms", duration_ms as f64, "status" => status.to_string());

        match report_repo::insert_trace_run(
            &self.db,
            "chat",
            "chat:supervisor",
            &params,
            &metrics_json,
            &artifacts,
        ) {
            Ok(run_id) => TrackerRunResult {
                enabled: true,
                run_id: Some(run_id),
                error: None,
            },
            Err(e) => {
                debug!(error = %e, "chat trace logging failed");
                TrackerRunResult {
                    enabled: true,
                    run_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_run_is_persisted_with_id() {
        let tracker = Tracker::new(Database::open_in_memory().unwrap());
        let result = tracker.log_report_run(
            "citadel_technical",
            &json!({"ticker": "PLTR"}),
            &json!({"markdown": "# Report", "sources_used": ["finviz"], "tool_plan": []}),
            1200,
            0.85,
            &json!({"thread_id": "t"}),
        );
        assert!(result.enabled);
        assert!(result.run_id.is_some());
        assert!(result.error.is_none());
    }

    #[test]
    fn chat_trace_counts_event_kinds() {
        let tracker = Tracker::new(Database::open_in_memory().unwrap());
        let events = vec![
            json!({"type": "agent_start", "agent": "market_data"}),
            json!({"type": "tool_end", "tool": "get_quote"}),
            json!({"type": "final"}),
        ];
        let result = tracker.log_chat_trace(
            "price of AAPL",
            "AAPL is at $212.50",
            &events,
            900,
            &["market_data".to_string()],
            "ok",
            None,
        );
        assert!(result.run_id.is_some());
    }
}
