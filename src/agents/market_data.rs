//! Market Data agent: quotes, history, movers, news, hours.
//!
//! Multi-symbol history comparisons are answered deterministically (merged
//! close table + per-symbol deltas); everything else goes through the LLM
//! tool loop with projected tool payloads.

use std::collections::HashMap;

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use crate::agents::{agent_query, status_for_all, AgentContext};
use crate::llm::{self, ToolDef};
use crate::models::{AgentName, AgentResult, AgentTask, AgentUpdate, HistoryRow, TaskState};
use crate::tools;

const SYSTEM_PROMPT: &str = "You are the Market Data Agent.\n\
Your role is to provide real-time and historical financial data, market news, and top movers.\n\
You have access to tools for retrieving stock quotes, history, profiles, top gainers/losers, and stock-specific news.\n\n\
Use the tools provided to answer the user's specific query.\n\
Return your answer in a clear, concise format.\n\
If you use a tool, summarize the data returned by the tool.";

lazy_static! {
    static ref DAYS_PATTERN: Regex = Regex::new(r"(?:last|past)\s+(\d{1,3})\s+day").unwrap();
}

pub fn tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef::new(
            "get_quote",
            "Get real-time stock quote for a symbol.",
            json!({"type": "object", "properties": {"symbol": {"type": "string"}}, "required": ["symbol"]}),
        ),
        ToolDef::new(
            "get_historical_prices",
            "Get daily historical prices for a symbol.",
            json!({"type": "object", "properties": {"symbol": {"type": "string"}, "days": {"type": "integer", "default": 30}}, "required": ["symbol"]}),
        ),
        ToolDef::new(
            "get_company_profile",
            "Get company profile and fundamental overview.",
            json!({"type": "object", "properties": {"symbol": {"type": "string"}}, "required": ["symbol"]}),
        ),
        ToolDef::new(
            "get_market_movers",
            "Get top market movers.",
            json!({"type": "object", "properties": {}}),
        ),
        ToolDef::new(
            "get_stock_news",
            "Get latest news articles for a stock symbol or broad market.",
            json!({"type": "object", "properties": {"symbol": {"type": "string"}, "limit": {"type": "integer", "default": 5}}}),
        ),
        ToolDef::new(
            "get_market_hours",
            "Get market hours by market type (equity, option, forex, etc.).",
            json!({"type": "object", "properties": {"markets": {"type": "array", "items": {"type": "string"}}}}),
        ),
    ]
}

/// Execute one market tool against the unified provider, returning the raw
/// result for projection.
pub async fn execute_tool(ctx: &AgentContext<'_>, name: &str, args: &Value) -> Value {
    let symbol = args.get("symbol").and_then(|v| v.as_str()).unwrap_or("");
    match name {
        "get_quote" => match ctx.deps.market.quote(symbol).await {
            Some(q) => serde_json::to_value(q).unwrap_or(Value::Null),
            None => json!({"symbol": symbol.to_uppercase(), "error": "No quote data available"}),
        },
        "get_historical_prices" => {
            let days = args.get("days").and_then(|v| v.as_u64()).unwrap_or(30) as u32;
            serde_json::to_value(ctx.deps.market.history(symbol, days).await).unwrap_or(json!([]))
        }
        "get_company_profile" => ctx.deps.market.company_profile(symbol).await,
        "get_market_movers" => ctx
            .deps
            .market
            .movers()
            .await
            .unwrap_or_else(|| json!({"gainers": [], "losers": []})),
        "get_stock_news" => {
            let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
            let sym = (!symbol.is_empty()).then_some(symbol);
            serde_json::to_value(ctx.deps.market.stock_news(sym, limit).await).unwrap_or(json!([]))
        }
        "get_market_hours" => {
            let markets: Vec<String> = args
                .get("markets")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|m| m.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            ctx.deps.market.market_hours(&markets).await.unwrap_or(json!({}))
        }
        _ => Value::Null,
    }
}

pub async fn run(ctx: &AgentContext<'_>, ready: &[AgentTask]) -> Result<AgentUpdate> {
    let query = agent_query(ctx, ready, "Run these market data requests");
    let mut update = AgentUpdate::default();
    if query.is_empty() {
        update.agent_results.insert(
            AgentName::MarketData,
            AgentResult {
                agent: AgentName::MarketData,
                content: String::new(),
                symbols: Vec::new(),
                data: None,
                error: Some("No query found".to_string()),
            },
        );
        update.task_status.extend(status_for_all(ready, TaskState::Failed));
        return Ok(update);
    }

    if let Some(result) = multi_symbol_history_compare(ctx, &query).await {
        update.agent_results.insert(AgentName::MarketData, result);
        update.task_status.extend(status_for_all(ready, TaskState::Completed));
        return Ok(update);
    }

    // LLM tool loop.
    let response = ctx
        .deps
        .llm
        .create_message(
            &crate::config::SETTINGS.analysis_model,
            SYSTEM_PROMPT,
            &[llm::user_message(&query)],
            Some(&tool_defs()),
            1500,
        )
        .await?;

    let mut content = response.text();
    let mut structured = Vec::new();
    let mut rendered = Vec::new();
    let mut symbols = Vec::new();
    for (_, name, input) in response.tool_uses().into_iter().take(6) {
        ctx.events.tool_start(name);
        let raw = execute_tool(ctx, name, input).await;
        let payload = tools::build_payload(name, input, &raw);
        rendered.push(tools::render_payload(&payload));
        structured.push(payload);
        ctx.events.tool_end(name);

        if let Some(sym) = input.get("symbol").and_then(|v| v.as_str()) {
            let sym = sym.to_uppercase();
            if !sym.is_empty() && !symbols.contains(&sym) {
                symbols.push(sym);
            }
        }
    }

    let mut data = None;
    if !rendered.is_empty() {
        content = rendered.join("\n\n");
        data = Some(json!({ "tool_results": structured }));
    }

    let state = if data.is_none() && content.is_empty() {
        TaskState::Failed
    } else {
        TaskState::Completed
    };
    update.task_status.extend(status_for_all(ready, state));
    update.agent_results.insert(
        AgentName::MarketData,
        AgentResult {
            agent: AgentName::MarketData,
            content,
            symbols,
            data,
            error: None,
        },
    );
    Ok(update)
}

// ── Deterministic multi-symbol compare ────────────────────

fn looks_like_history_request(query: &str) -> bool {
    let text = query.to_lowercase();
    let history_terms = ["price", "close", "history", "last", "past", "days", "trading days"];
    let compare_terms = ["compare", "vs", "versus", "both"];
    history_terms.iter().any(|t| text.contains(t)) && compare_terms.iter().any(|t| text.contains(t))
}

pub fn extract_days(query: &str) -> u32 {
    let text = query.to_lowercase();
    if let Some(cap) = DAYS_PATTERN.captures(&text) {
        if let Ok(n) = cap[1].parse::<u32>() {
            return n.clamp(2, 90);
        }
    }
    if text.contains("week") {
        return 7;
    }
    5
}

fn extract_compare_symbols(text: &str) -> Vec<String> {
    let mut symbols = Vec::new();
    for (name, ticker) in [
        ("apple", "AAPL"),
        ("microsoft", "MSFT"),
        ("tesla", "TSLA"),
        ("nvidia", "NVDA"),
        ("rivian", "RIVN"),
        ("amazon", "AMZN"),
        ("alphabet", "GOOGL"),
        ("google", "GOOGL"),
        ("meta", "META"),
    ] {
        if text.to_lowercase().contains(name) && !symbols.contains(&ticker.to_string()) {
            symbols.push(ticker.to_string());
        }
    }
    let stop_words = ["THE", "AND", "FOR", "WITH", "PRICE", "LAST", "PAST", "DAYS", "BOTH", "VS", "USD"];
    lazy_static! {
        static ref COMPARE_TICKER: Regex = Regex::new(r"\$([A-Z]{1,5})\b|\b([A-Z]{2,5})\b").unwrap();
    }
    for cap in COMPARE_TICKER.captures_iter(text) {
        let token = cap
            .get(1)
            .or_else(|| cap.get(2))
            .map(|m| m.as_str().to_uppercase())
            .unwrap_or_default();
        if token.is_empty() || stop_words.contains(&token.as_str()) {
            continue;
        }
        if !symbols.contains(&token) {
            symbols.push(token);
        }
    }
    symbols
}

async fn multi_symbol_history_compare(ctx: &AgentContext<'_>, query: &str) -> Option<AgentResult> {
    if !looks_like_history_request(query) {
        return None;
    }
    let symbols = extract_compare_symbols(query);
    if symbols.len() < 2 {
        return None;
    }

    let days = extract_days(query);
    let mut history_by_symbol: HashMap<String, Vec<HistoryRow>> = HashMap::new();
    let mut tool_results = Vec::new();
    let mut ordered_symbols = Vec::new();
    for symbol in symbols.into_iter().take(4) {
        ctx.events.tool_start("get_historical_prices");
        let rows = ctx.deps.market.history(&symbol, days).await;
        ctx.events.tool_end("get_historical_prices");
        tool_results.push(tools::build_payload(
            "get_historical_prices",
            &json!({"symbol": symbol, "days": days}),
            &serde_json::to_value(&rows).unwrap_or(json!([])),
        ));
        ordered_symbols.push(symbol.clone());
        history_by_symbol.insert(symbol, rows);
    }

    if history_by_symbol.values().all(|rows| rows.is_empty()) {
        return None;
    }

    let content = format_history_compare(&ordered_symbols, &history_by_symbol, days as usize);
    Some(AgentResult {
        agent: AgentName::MarketData,
        content,
        symbols: ordered_symbols.clone(),
        data: Some(json!({
            "tool_results": tool_results,
            "history_by_symbol": history_by_symbol,
            "days": days,
        })),
        error: None,
    })
}

fn format_history_compare(
    symbols: &[String],
    history_by_symbol: &HashMap<String, Vec<HistoryRow>>,
    days: usize,
) -> String {
    // date -> symbol -> close
    let mut rows_by_date: std::collections::BTreeMap<String, HashMap<String, f64>> =
        std::collections::BTreeMap::new();
    for (symbol, rows) in history_by_symbol {
        for row in rows {
            rows_by_date
                .entry(row.date.clone())
                .or_default()
                .insert(symbol.clone(), row.close);
        }
    }

    let dates: Vec<&String> = rows_by_date.keys().collect();
    let start = dates.len().saturating_sub(days);
    let window = &dates[start..];

    let mut table = vec![
        format!("| Date | {} |", symbols.join(" | ")),
        format!("|{}", "---|".repeat(symbols.len() + 1)),
    ];
    for date in window {
        let cells: Vec<String> = symbols
            .iter()
            .map(|sym| {
                rows_by_date
                    .get(*date)
                    .and_then(|by_sym| by_sym.get(sym))
                    .map(|c| format!("{c:.2}"))
                    .unwrap_or_else(|| "-".to_string())
            })
            .collect();
        table.push(format!("| {} | {} |", date, cells.join(" | ")));
    }

    let mut summary = Vec::new();
    for symbol in symbols {
        let rows = history_by_symbol.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
        if rows.len() < 2 {
            summary.push(format!("- {symbol}: insufficient recent rows returned."));
            continue;
        }
        let tail_start = rows.len().saturating_sub(days);
        let window = &rows[tail_start..];
        let start_row = &window[0];
        let end_row = &window[window.len() - 1];
        let pct = if start_row.close != 0.0 {
            (end_row.close - start_row.close) / start_row.close * 100.0
        } else {
            0.0
        };
        summary.push(format!(
            "- {symbol}: {} ${:.2} -> {} ${:.2} ({:+.1}%).",
            start_row.date, start_row.close, end_row.date, end_row.close, pct
        ));
    }

    let mut out = vec![format!(
        "Here are the latest {days} trading-day closes for {}.",
        symbols.join(", ")
    )];
    out.push(String::new());
    out.extend(summary);
    out.push(String::new());
    out.extend(table);
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(symbol: &str, closes: &[(&str, f64)]) -> Vec<HistoryRow> {
        closes
            .iter()
            .map(|(date, close)| HistoryRow {
                symbol: symbol.to_string(),
                date: date.to_string(),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: 1,
            })
            .collect()
    }

    #[test]
    fn history_request_detection() {
        assert!(looks_like_history_request("Compare AAPL vs MSFT last 5 trading days"));
        assert!(looks_like_history_request("price history for both TSLA and NVDA"));
        assert!(!looks_like_history_request("What is the price of AAPL?"));
        assert!(!looks_like_history_request("Compare AAPL and MSFT moats"));
    }

    #[test]
    fn day_count_extraction() {
        assert_eq!(extract_days("compare over the last 12 days"), 12);
        assert_eq!(extract_days("past week comparison"), 7);
        assert_eq!(extract_days("compare closes"), 5);
        assert_eq!(extract_days("past 500 days"), 90);
        assert_eq!(extract_days("past 1 day"), 2);
    }

    #[test]
    fn compare_symbols_mix_aliases_and_tickers() {
        let symbols = extract_compare_symbols("Compare apple vs $MSFT vs NVDA last 5 days");
        assert_eq!(symbols[0], "AAPL");
        assert!(symbols.contains(&"MSFT".to_string()));
        assert!(symbols.contains(&"NVDA".to_string()));
        assert!(!symbols.contains(&"DAYS".to_string()));
    }

    #[test]
    fn compare_table_has_symbols_dates_and_deltas() {
        let mut by_symbol = HashMap::new();
        by_symbol.insert(
            "AAPL".to_string(),
            rows("AAPL", &[("2025-06-26", 100.0), ("2025-06-27", 110.0)]),
        );
        by_symbol.insert(
            "MSFT".to_string(),
            rows("MSFT", &[("2025-06-26", 400.0), ("2025-06-27", 398.0)]),
        );
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        let out = format_history_compare(&symbols, &by_symbol, 5);
        assert!(out.contains("| Date | AAPL | MSFT |"));
        assert!(out.contains("| 2025-06-27 | 110.00 | 398.00 |"));
        assert!(out.contains("- AAPL: 2025-06-26 $100.00 -> 2025-06-27 $110.00 (+10.0%)."));
        assert!(out.contains("- MSFT: "));
        assert!(out.contains("(-0.5%)."));
    }

    #[test]
    fn missing_dates_render_as_dash() {
        let mut by_symbol = HashMap::new();
        by_symbol.insert(
            "AAPL".to_string(),
            rows("AAPL", &[("2025-06-26", 100.0), ("2025-06-27", 101.0)]),
        );
        by_symbol.insert("MSFT".to_string(), rows("MSFT", &[("2025-06-27", 400.0)]));
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        let out = format_history_compare(&symbols, &by_symbol, 5);
        assert!(out.contains("| 2025-06-26 | 100.00 | - |"));
    }
}
