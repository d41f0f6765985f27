//! Technical Analysis agent.
//!
//! Reads the projected price history published by the market_data agent this
//! turn, runs the indicator math, and asks the LLM for a short read of the
//! numbers. An empty or malformed price payload is a reported failure.

use anyhow::Result;
use serde_json::{json, Value};

use crate::agents::{agent_query, extract_symbols, status_for_all, AgentContext};
use crate::llm;
use crate::models::{AgentName, AgentResult, AgentTask, AgentUpdate, HistoryRow, TaskState};
use crate::ta;

const SYSTEM_PROMPT: &str = "You are a Technical Analysis Specialist.\n\
Your job is to analyze stock market data using technical indicators like SMA, RSI, and MACD.\n\
Use the provided indicator readings and provide a summary of the technical outlook.\n\
Do not make up data.";

/// Pull usable history rows out of the market_data result, in the shapes that
/// agent publishes: projected output list, raw list, per-symbol map, or
/// structured tool_results.
pub fn extract_price_data(md_data: &Value, query: &str) -> Vec<HistoryRow> {
    let target_symbol = extract_symbols(query, 1).into_iter().next();

    let rows_from = |value: &Value| -> Vec<HistoryRow> {
        value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|row| serde_json::from_value::<HistoryRow>(row.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    };

    if md_data.is_array() {
        return rows_from(md_data);
    }
    let Some(obj) = md_data.as_object() else {
        return Vec::new();
    };

    for key in ["raw", "output"] {
        if let Some(value) = obj.get(key) {
            let rows = rows_from(value);
            if !rows.is_empty() {
                return rows;
            }
        }
    }

    if let Some(by_symbol) = obj.get("history_by_symbol").and_then(|v| v.as_object()) {
        if let Some(ref target) = target_symbol {
            if let Some(rows) = by_symbol.get(target) {
                let parsed = rows_from(rows);
                if !parsed.is_empty() {
                    return parsed;
                }
            }
        }
        for rows in by_symbol.values() {
            let parsed = rows_from(rows);
            if !parsed.is_empty() {
                return parsed;
            }
        }
    }

    if let Some(tool_results) = obj.get("tool_results").and_then(|v| v.as_array()) {
        for payload in tool_results {
            if payload.get("tool").and_then(|v| v.as_str()) != Some("get_historical_prices") {
                continue;
            }
            let Some(output) = payload.get("output") else { continue };
            let rows = rows_from(output);
            if rows.is_empty() {
                continue;
            }
            if let Some(ref target) = target_symbol {
                let filtered: Vec<HistoryRow> = rows
                    .iter()
                    .filter(|r| r.symbol.eq_ignore_ascii_case(target))
                    .cloned()
                    .collect();
                if !filtered.is_empty() {
                    return filtered;
                }
            }
            return rows;
        }
    }

    Vec::new()
}

/// Run the requested indicator over the closes. Mirrors the tool surface the
/// planner knows about: SMA, RSI, MACD, or the composite snapshot.
fn run_indicator(query: &str, symbol: &str, closes: &[f64]) -> Result<Value> {
    let lower = query.to_lowercase();
    if lower.contains("macd") {
        let reading = ta::macd(closes)?;
        return Ok(json!({
            "symbol": symbol,
            "indicator": "MACD",
            "macd_line": reading.macd_line,
            "signal_line": reading.signal_line,
            "histogram": reading.histogram,
            "signal": reading.signal,
        }));
    }
    if lower.contains("sma") || lower.contains("moving average") {
        let value = ta::sma(closes, 14)?;
        let current = closes.last().copied().unwrap_or(0.0);
        return Ok(json!({
            "symbol": symbol,
            "indicator": "SMA",
            "period": 14,
            "value": value,
            "signal": if current > value { "buy" } else { "sell" },
        }));
    }
    if lower.contains("rsi") {
        let value = ta::rsi(closes, 14)?;
        return Ok(json!({
            "symbol": symbol,
            "indicator": "RSI",
            "period": 14,
            "value": value,
            "signal": ta::rsi_label(value),
        }));
    }
    // Composite when no single indicator was named.
    match ta::analyze(symbol, closes) {
        Ok(snapshot) => Ok(serde_json::to_value(snapshot)?),
        Err(_) => {
            // Shorter series still answer an RSI-level question.
            let value = ta::rsi(closes, 14)?;
            Ok(json!({
                "symbol": symbol,
                "indicator": "RSI",
                "period": 14,
                "value": value,
                "signal": ta::rsi_label(value),
            }))
        }
    }
}

pub async fn run(ctx: &AgentContext<'_>, ready: &[AgentTask]) -> Result<AgentUpdate> {
    let query = agent_query(ctx, ready, "Run these technical analysis requests");
    let mut update = AgentUpdate::default();

    let price_data = ctx
        .agent_results
        .get(&AgentName::MarketData)
        .and_then(|r| r.data.as_ref())
        .map(|data| extract_price_data(data, &query))
        .unwrap_or_default();

    let symbol = extract_symbols(&query, 1)
        .into_iter()
        .next()
        .or_else(|| price_data.first().map(|r| r.symbol.clone()))
        .unwrap_or_default();

    let closes = ta::extract_closes(&price_data);
    ctx.events.tool_start("calculate_indicators");
    let indicator = run_indicator(&query, &symbol, &closes);
    ctx.events.tool_end("calculate_indicators");

    match indicator {
        Ok(tool_data) => {
            // One re-invocation with the tool result to phrase the outlook.
            let content = match summarize(ctx, &query, &tool_data).await {
                Some(text) if !text.is_empty() => text,
                _ => fallback_summary(&tool_data),
            };
            update.task_status.extend(status_for_all(ready, TaskState::Completed));
            update.agent_results.insert(
                AgentName::TechnicalAnalysis,
                AgentResult {
                    agent: AgentName::TechnicalAnalysis,
                    content,
                    symbols: if symbol.is_empty() { vec![] } else { vec![symbol] },
                    data: Some(tool_data),
                    error: None,
                },
            );
        }
        Err(e) => {
            let message = format!(
                "I could not complete technical indicator calculations from the available price payload. Error: {e}"
            );
            update.task_status.extend(status_for_all(ready, TaskState::Failed));
            update.agent_results.insert(
                AgentName::TechnicalAnalysis,
                AgentResult {
                    agent: AgentName::TechnicalAnalysis,
                    content: message,
                    symbols: Vec::new(),
                    data: None,
                    error: Some(e.to_string()),
                },
            );
        }
    }
    Ok(update)
}

async fn summarize(ctx: &AgentContext<'_>, query: &str, tool_data: &Value) -> Option<String> {
    let prompt = format!(
        "{query}\n\nIndicator readings (computed from live price history):\n{tool_data}"
    );
    ctx.deps
        .llm
        .create_message(
            &crate::config::SETTINGS.analysis_model,
            SYSTEM_PROMPT,
            &[llm::user_message(&prompt)],
            None,
            800,
        )
        .await
        .ok()
        .map(|r| r.text())
}

/// Deterministic phrasing used when the LLM pass is unavailable.
fn fallback_summary(tool_data: &Value) -> String {
    if let Some(indicator) = tool_data.get("indicator").and_then(|v| v.as_str()) {
        return format!(
            "{} {}: {} ({})",
            tool_data.get("symbol").and_then(|v| v.as_str()).unwrap_or(""),
            indicator,
            tool_data
                .get("value")
                .or_else(|| tool_data.get("macd_line"))
                .map(|v| v.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            tool_data.get("signal").and_then(|v| v.as_str()).unwrap_or("n/a"),
        );
    }
    format!(
        "{} technical snapshot: trend {}, RSI(14) {:.1}, support ${:.2} / resistance ${:.2}.",
        tool_data.get("symbol").and_then(|v| v.as_str()).unwrap_or(""),
        tool_data.get("trend").and_then(|v| v.as_str()).unwrap_or("n/a"),
        tool_data.get("rsi_14").and_then(|v| v.as_f64()).unwrap_or(0.0),
        tool_data.get("support").and_then(|v| v.as_f64()).unwrap_or(0.0),
        tool_data.get("resistance").and_then(|v| v.as_f64()).unwrap_or(0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows_json(symbol: &str, n: usize) -> Value {
        let rows: Vec<Value> = (0..n)
            .map(|i| {
                json!({
                    "symbol": symbol,
                    "date": format!("2025-01-{:02}", (i % 28) + 1),
                    "open": 100.0 + i as f64,
                    "high": 101.0 + i as f64,
                    "low": 99.0 + i as f64,
                    "close": 100.0 + i as f64,
                    "volume": 1000,
                })
            })
            .collect();
        Value::Array(rows)
    }

    #[test]
    fn extracts_from_raw_and_output() {
        let data = json!({"raw": rows_json("MSFT", 5)});
        assert_eq!(extract_price_data(&data, "RSI for MSFT").len(), 5);
        let data = json!({"output": rows_json("MSFT", 3)});
        assert_eq!(extract_price_data(&data, "RSI for MSFT").len(), 3);
    }

    #[test]
    fn extracts_symbol_scoped_history_map() {
        let data = json!({
            "history_by_symbol": {
                "AAPL": rows_json("AAPL", 4),
                "MSFT": rows_json("MSFT", 6),
            }
        });
        let rows = extract_price_data(&data, "Calculate RSI for MSFT");
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| r.symbol == "MSFT"));
    }

    #[test]
    fn extracts_from_structured_tool_results() {
        let data = json!({
            "tool_results": [
                {"tool": "get_quote", "output": {"symbol": "MSFT"}},
                {"tool": "get_historical_prices", "output": rows_json("MSFT", 7)},
            ]
        });
        assert_eq!(extract_price_data(&data, "technicals for MSFT").len(), 7);
    }

    #[test]
    fn empty_payload_yields_no_rows() {
        assert!(extract_price_data(&json!({}), "RSI for MSFT").is_empty());
        assert!(extract_price_data(&Value::Null, "RSI").is_empty());
    }

    #[test]
    fn rsi_answer_for_short_series() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i % 5) as f64).collect();
        let out = run_indicator("What is the RSI for MSFT?", "MSFT", &closes).unwrap();
        assert_eq!(out["indicator"], "RSI");
        assert!(out["value"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn insufficient_data_is_an_error() {
        let closes = vec![100.0, 101.0];
        let err = run_indicator("RSI for MSFT", "MSFT", &closes).unwrap_err();
        assert!(err.to_string().contains("Not enough data"));
    }

    #[test]
    fn composite_for_long_series() {
        let closes: Vec<f64> = (0..260).map(|i| 100.0 + i as f64 * 0.1).collect();
        let out = run_indicator("full technical analysis of AAPL", "AAPL", &closes).unwrap();
        assert!(out.get("trend").is_some());
        assert!(out.get("support").is_some());
    }

    #[test]
    fn fallback_summary_mentions_value() {
        let out = fallback_summary(&json!({
            "symbol": "MSFT", "indicator": "RSI", "period": 14, "value": 62.4, "signal": "neutral"
        }));
        assert!(out.contains("MSFT RSI"));
        assert!(out.contains("62.4"));
    }
}
