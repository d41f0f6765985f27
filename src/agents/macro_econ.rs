//! Macro agent: FRED-backed economic analysis via an LLM tool loop.

use anyhow::Result;
use serde_json::{json, Value};

use crate::agents::{agent_query, status_for_all, AgentContext};
use crate::llm::{self, ToolDef};
use crate::models::{AgentName, AgentResult, AgentTask, AgentUpdate, TaskState};

const MACRO_PROMPT: &str = "You are an expert Macroeconomist Agent.\n\
Your goal is to provide data-driven analysis of economic conditions and their impact on financial markets.\n\n\
You have access to the FRED (Federal Reserve Economic Data) database.\n\n\
When analyzing:\n\
1.  **Context**: Always consider the current economic cycle (e.g., expansion, recession, inflation).\n\
2.  **Data-Backed**: Use specific data points (e.g., \"CPI is 3.2%\", \"Unemployment is 4.1%\").\n\
3.  **Impact**: Explain how these factors influence asset classes (stocks, bonds, sectors).\n\
4.  **Trends**: Look at unexpected changes or trends, not just the latest number.\n\n\
Use `get_macro_summary` for a quick overview.\n\
Use `get_economic_series` for deep dives into specific indicators (e.g., `DGS10` for 10Y Yield).\n\
Use `search_economic_data` to find specialized datasets (e.g., \"housing starts\").\n\n\
Synthesize your findings into a clear, concise summary.";

fn tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef::new(
            "get_macro_summary",
            "Get a summary of key macroeconomic indicators (GDP, CPI, Unemployment, Fed Funds, 10Y Treasury).",
            json!({"type": "object", "properties": {}}),
        ),
        ToolDef::new(
            "get_economic_series",
            "Get detailed data for a specific economic series from FRED.",
            json!({"type": "object", "properties": {"series_id": {"type": "string"}, "limit": {"type": "integer", "default": 12}}, "required": ["series_id"]}),
        ),
        ToolDef::new(
            "search_economic_data",
            "Search for economic data series in the FRED database.",
            json!({"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]}),
        ),
    ]
}

async fn execute_tool(ctx: &AgentContext<'_>, name: &str, args: &Value) -> Value {
    match name {
        "get_macro_summary" => {
            serde_json::to_value(ctx.deps.fred.get_key_indicators().await).unwrap_or(json!({}))
        }
        "get_economic_series" => {
            let series_id = args.get("series_id").and_then(|v| v.as_str()).unwrap_or("");
            let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(12) as usize;
            ctx.deps
                .fred
                .get_series_data(series_id, limit)
                .await
                .and_then(|s| serde_json::to_value(s).ok())
                .unwrap_or(Value::Null)
        }
        "search_economic_data" => {
            let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
            ctx.deps
                .fred
                .search_series(query, 5)
                .await
                .and_then(|s| serde_json::to_value(s).ok())
                .unwrap_or(json!([]))
        }
        _ => Value::Null,
    }
}

pub async fn run(ctx: &AgentContext<'_>, ready: &[AgentTask]) -> Result<AgentUpdate> {
    let query = agent_query(ctx, ready, "Run these macro analysis requests");

    // Single tool round: request -> tool calls -> final synthesis.
    let mut messages = vec![llm::user_message(&query)];
    let response = ctx
        .deps
        .llm
        .create_message(
            &crate::config::SETTINGS.analysis_model,
            MACRO_PROMPT,
            &messages,
            Some(&tool_defs()),
            1500,
        )
        .await?;

    let mut content = response.text();
    let tool_uses: Vec<(String, String, Value)> = response
        .tool_uses()
        .into_iter()
        .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
        .collect();

    if !tool_uses.is_empty() {
        for (id, name, input) in &tool_uses {
            ctx.events.tool_start(name);
            let raw = execute_tool(ctx, name, input).await;
            ctx.events.tool_end(name);
            messages.push(llm::assistant_tool_use_message(id, name, input));
            messages.push(llm::tool_result_message(id, &raw.to_string()));
        }
        let followup = ctx
            .deps
            .llm
            .create_message(
                &crate::config::SETTINGS.analysis_model,
                MACRO_PROMPT,
                &messages,
                Some(&tool_defs()),
                1500,
            )
            .await?;
        let followup_text = followup.text();
        if !followup_text.is_empty() {
            content = followup_text;
        }
    }

    let mut update = AgentUpdate::default();
    update.task_status.extend(status_for_all(ready, TaskState::Completed));
    update.agent_results.insert(
        AgentName::Macro,
        AgentResult {
            agent: AgentName::Macro,
            content,
            symbols: Vec::new(),
            data: Some(json!({})),
            error: None,
        },
    );
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_defs_cover_the_three_fred_surfaces() {
        let defs = tool_defs();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["get_macro_summary", "get_economic_series", "search_economic_data"]
        );
        assert_eq!(defs[1].input_schema["required"][0], "series_id");
    }
}
