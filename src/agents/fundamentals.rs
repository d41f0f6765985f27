//! Fundamentals agent: company research, analyst ratings, insider trades,
//! company news, with a deterministic overview backfill for tickers the LLM
//! under-selected.

use anyhow::Result;
use serde_json::{json, Value};

use crate::agents::{agent_query, extract_symbols, status_for_all, AgentContext};
use crate::llm::{self, ToolDef};
use crate::models::{AgentName, AgentResult, AgentTask, AgentUpdate, TaskState};
use crate::tools;

const SYSTEM_PROMPT: &str = "You are a fundamental analysis specialist. Use the tools to research \
companies. Focus on key financial metrics, analyst opinions, and insider activity.";

fn tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef::new(
            "get_company_overview",
            "Get company fundamentals: sector, market cap, P/E, revenue, margins, employees, etc.",
            json!({"type": "object", "properties": {"symbol": {"type": "string"}}, "required": ["symbol"]}),
        ),
        ToolDef::new(
            "get_analyst_ratings",
            "Get analyst ratings, price targets, and recommendation changes.",
            json!({"type": "object", "properties": {"symbol": {"type": "string"}}, "required": ["symbol"]}),
        ),
        ToolDef::new(
            "get_insider_trades",
            "Get insider trading activity — officer and director buys/sells.",
            json!({"type": "object", "properties": {"symbol": {"type": "string"}, "limit": {"type": "integer", "default": 10}}, "required": ["symbol"]}),
        ),
        ToolDef::new(
            "get_company_news",
            "Get recent news articles about a company.",
            json!({"type": "object", "properties": {"symbol": {"type": "string"}, "limit": {"type": "integer", "default": 10}}, "required": ["symbol"]}),
        ),
    ]
}

struct ToolResult {
    tool: String,
    symbol: String,
    data: Option<Value>,
    text: Option<String>,
}

async fn call_finviz_tool(
    ctx: &AgentContext<'_>,
    tool: &str,
    symbol: &str,
    limit: usize,
) -> Option<Value> {
    ctx.events.tool_start(tool);
    let data = match tool {
        "get_company_overview" => ctx.deps.finviz.get_company_overview(symbol).await,
        "get_analyst_ratings" => ctx.deps.finviz.get_analyst_ratings(symbol).await,
        "get_insider_trades" => ctx.deps.finviz.get_insider_trades(symbol, limit).await,
        "get_company_news" => ctx.deps.finviz.get_company_news(symbol, limit).await,
        _ => None,
    };
    ctx.events.tool_end(&format!("{tool}({symbol})"));
    data
}

pub async fn run(ctx: &AgentContext<'_>, ready: &[AgentTask]) -> Result<AgentUpdate> {
    let query = agent_query(ctx, ready, "Compare and execute these fundamentals requests");
    let mut update = AgentUpdate::default();

    let response = ctx
        .deps
        .llm
        .create_message(
            &crate::config::SETTINGS.routing_model,
            SYSTEM_PROMPT,
            &[llm::user_message(&query)],
            Some(&tool_defs()),
            1500,
        )
        .await?;

    let mut results: Vec<ToolResult> = Vec::new();
    let mut structured = Vec::new();
    let mut symbols: Vec<String> = Vec::new();

    for block in &response.content {
        match block {
            crate::llm::ContentBlock::Text { text } => {
                results.push(ToolResult {
                    tool: "text".into(),
                    symbol: String::new(),
                    data: None,
                    text: Some(text.clone()),
                });
            }
            crate::llm::ContentBlock::ToolUse { name, input, .. } => {
                let symbol = input
                    .get("symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_uppercase();
                if symbol.is_empty() {
                    continue;
                }
                let limit = input.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
                let data = call_finviz_tool(ctx, name, &symbol, limit).await;
                if let Some(ref raw) = data {
                    structured.push(tools::build_payload(name, input, raw));
                }
                if !symbols.contains(&symbol) {
                    symbols.push(symbol.clone());
                }
                results.push(ToolResult {
                    tool: name.clone(),
                    symbol,
                    data,
                    text: None,
                });
            }
            crate::llm::ContentBlock::Other => {}
        }
    }

    // Backfill overviews for tickers the user named but the LLM skipped.
    let mentioned = extract_symbols(&query, 5);
    let covered: Vec<String> = results
        .iter()
        .filter(|r| r.tool == "get_company_overview")
        .map(|r| r.symbol.clone())
        .collect();
    for sym in mentioned {
        if covered.contains(&sym) {
            continue;
        }
        let data = call_finviz_tool(ctx, "get_company_overview", &sym, 10).await;
        if let Some(ref raw) = data {
            structured.push(tools::build_payload(
                "get_company_overview",
                &json!({"symbol": sym}),
                raw,
            ));
        }
        if !symbols.contains(&sym) {
            symbols.push(sym.clone());
        }
        results.push(ToolResult {
            tool: "get_company_overview".into(),
            symbol: sym,
            data,
            text: None,
        });
    }

    let content = format_results(&results);
    update.task_status.extend(status_for_all(ready, TaskState::Completed));
    update.agent_results.insert(
        AgentName::Fundamentals,
        AgentResult {
            agent: AgentName::Fundamentals,
            content,
            symbols,
            data: Some(json!({ "tool_results": structured })),
            error: None,
        },
    );
    Ok(update)
}

fn display(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "N/A".to_string(),
        Some(Value::String(s)) if s.trim().is_empty() => "N/A".to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(v) => v.to_string(),
    }
}

fn format_results(results: &[ToolResult]) -> String {
    let mut parts = Vec::new();
    for r in results {
        if r.tool == "text" {
            if let Some(ref text) = r.text {
                if !text.trim().is_empty() {
                    parts.push(text.clone());
                }
            }
            continue;
        }
        let Some(ref d) = r.data else { continue };
        match r.tool.as_str() {
            "get_company_overview" => {
                parts.push(format!(
                    "**{}** — {}\nSector: {} | Industry: {}\nMarket Cap: {} | P/E: {} | Forward P/E: {}\nEPS: {} | Revenue: {} | Profit Margin: {}\nROE: {} | Debt/Eq: {} | Dividend: {}\nTarget Price: {} | Beta: {}",
                    display(d.get("symbol")),
                    display(d.get("company")),
                    display(d.get("sector")),
                    display(d.get("industry")),
                    display(d.get("market_cap")),
                    display(d.get("pe")),
                    display(d.get("forward_pe")),
                    display(d.get("eps")),
                    display(d.get("revenue")),
                    display(d.get("profit_margin")),
                    display(d.get("roe")),
                    display(d.get("debt_eq")),
                    display(d.get("dividend_yield")),
                    display(d.get("target_price")),
                    display(d.get("beta")),
                ));
            }
            "get_analyst_ratings" => {
                let Some(ratings) = d.get("ratings").and_then(|v| v.as_array()) else {
                    continue;
                };
                if ratings.is_empty() {
                    continue;
                }
                let mut lines = vec![format!(
                    "**Analyst Ratings for {}** ({} recent)",
                    display(d.get("symbol")),
                    ratings.len()
                )];
                for rating in ratings.iter().take(5) {
                    lines.push(format!(
                        "  {} — {}: {} → {} (PT: {})",
                        display(rating.get("date")),
                        display(rating.get("analyst")),
                        display(rating.get("action")),
                        display(rating.get("rating")),
                        display(rating.get("price_target")),
                    ));
                }
                parts.push(lines.join("\n"));
            }
            "get_insider_trades" => {
                let Some(trades) = d.get("insider_trades").and_then(|v| v.as_array()) else {
                    continue;
                };
                if trades.is_empty() {
                    continue;
                }
                let mut lines = vec![format!(
                    "**Insider Trading for {}** ({} recent)",
                    display(d.get("symbol")),
                    trades.len()
                )];
                for t in trades.iter().take(5) {
                    lines.push(format!(
                        "  {} — {}: {} | Value: {}",
                        display(t.get("date")),
                        display(t.get("insider")),
                        display(t.get("transaction")),
                        display(t.get("value")),
                    ));
                }
                parts.push(lines.join("\n"));
            }
            "get_company_news" => {
                let Some(news) = d.get("news").and_then(|v| v.as_array()) else {
                    continue;
                };
                if news.is_empty() {
                    continue;
                }
                let mut lines = vec![format!("**Recent News for {}**", display(d.get("symbol")))];
                for article in news.iter().take(5) {
                    lines.push(format!(
                        "  {} — {} ({})",
                        display(article.get("date")),
                        display(article.get("headline")),
                        display(article.get("source")),
                    ));
                }
                parts.push(lines.join("\n"));
            }
            _ => {}
        }
    }
    if parts.is_empty() {
        "No fundamental data available.".to_string()
    } else {
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overview_formatting() {
        let results = vec![ToolResult {
            tool: "get_company_overview".into(),
            symbol: "AAPL".into(),
            data: Some(json!({
                "symbol": "AAPL", "company": "Apple Inc.", "sector": "Technology",
                "industry": "Consumer Electronics", "market_cap": "3.2T", "pe": "33.5",
                "roe": "147%", "debt_eq": "1.45", "dividend_yield": "0.44%",
            })),
            text: None,
        }];
        let out = format_results(&results);
        assert!(out.contains("**AAPL** — Apple Inc."));
        assert!(out.contains("Market Cap: 3.2T"));
        assert!(out.contains("Forward P/E: N/A"));
    }

    #[test]
    fn empty_results_fall_back() {
        assert_eq!(format_results(&[]), "No fundamental data available.");
    }

    #[test]
    fn ratings_section_caps_at_five() {
        let ratings: Vec<Value> = (0..8)
            .map(|i| json!({"date": format!("d{i}"), "analyst": "Firm", "action": "Reiterated", "rating": "Buy", "price_target": "$100"}))
            .collect();
        let results = vec![ToolResult {
            tool: "get_analyst_ratings".into(),
            symbol: "MSFT".into(),
            data: Some(json!({"symbol": "MSFT", "ratings": ratings})),
            text: None,
        }];
        let out = format_results(&results);
        assert!(out.contains("(8 recent)"));
        assert_eq!(out.matches("Reiterated").count(), 5);
    }
}
