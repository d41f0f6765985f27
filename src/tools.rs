//! Canonical tool contracts and output projection.
//!
//! The projected `output` is the only cross-agent truth: every specialist
//! reads peer tool results through the declared field lists, never the raw
//! provider response.

use lazy_static::lazy_static;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
pub struct ToolContract {
    pub source: &'static str,
    pub endpoint: &'static str,
    pub input: Value,
    pub output_fields: Vec<&'static str>,
}

lazy_static! {
    static ref CONTRACTS: Vec<(&'static str, ToolContract)> = vec![
        (
            "get_quote",
            ToolContract {
                source: "schwab_market_data",
                endpoint: "GET /quotes",
                input: json!({"symbol": "string"}),
                output_fields: vec![
                    "symbol", "price", "change", "percent_change", "volume", "open", "high",
                    "low", "timestamp", "provider",
                ],
            },
        ),
        (
            "get_historical_prices",
            ToolContract {
                source: "schwab_market_data",
                endpoint: "GET /pricehistory",
                input: json!({"symbol": "string", "days": "int"}),
                output_fields: vec!["symbol", "date", "open", "high", "low", "close", "volume"],
            },
        ),
        (
            "get_company_profile",
            ToolContract {
                source: "finviz",
                endpoint: "company profile scrape",
                input: json!({"symbol": "string"}),
                output_fields: vec![
                    "symbol", "company", "sector", "industry", "market_cap", "pe", "dividend_yield",
                ],
            },
        ),
        (
            "get_market_movers",
            ToolContract {
                source: "schwab_market_data",
                endpoint: "GET /movers/{symbol_id}",
                input: json!({}),
                output_fields: vec![
                    "index", "sort", "movers[].symbol", "movers[].last_price", "movers[].change",
                ],
            },
        ),
        (
            "get_stock_news",
            ToolContract {
                source: "alpaca_news",
                endpoint: "news endpoint",
                input: json!({"symbol": "string|null", "limit": "int"}),
                output_fields: vec!["headline", "source", "url", "timestamp", "summary", "symbols"],
            },
        ),
        (
            "get_market_hours",
            ToolContract {
                source: "schwab_market_data",
                endpoint: "GET /markets",
                input: json!({"markets": "list[str]|null"}),
                output_fields: vec!["market", "product", "is_open", "date", "session_hours"],
            },
        ),
        (
            "get_company_overview",
            ToolContract {
                source: "finviz",
                endpoint: "company overview scrape",
                input: json!({"symbol": "string"}),
                output_fields: vec![
                    "symbol", "company", "sector", "industry", "market_cap", "pe", "debt_eq",
                    "target_price",
                ],
            },
        ),
        (
            "get_analyst_ratings",
            ToolContract {
                source: "finviz",
                endpoint: "ratings scrape",
                input: json!({"symbol": "string"}),
                output_fields: vec![
                    "symbol", "ratings[].date", "ratings[].analyst", "ratings[].action",
                    "ratings[].rating",
                ],
            },
        ),
        (
            "get_insider_trades",
            ToolContract {
                source: "finviz",
                endpoint: "insider trades scrape",
                input: json!({"symbol": "string", "limit": "int"}),
                output_fields: vec![
                    "symbol", "insider_trades[].date", "insider_trades[].insider",
                    "insider_trades[].transaction",
                ],
            },
        ),
        (
            "get_company_news",
            ToolContract {
                source: "finviz",
                endpoint: "company news scrape",
                input: json!({"symbol": "string", "limit": "int"}),
                output_fields: vec!["symbol", "news[].date", "news[].headline", "news[].source"],
            },
        ),
    ];
}

/// Endpoint reference tables served by the tooling router.
pub fn schwab_endpoint_reference() -> Value {
    json!({
        "market_data": [
            {"method": "GET", "path": "/quotes", "summary": "Quotes by comma-separated symbols"},
            {"method": "GET", "path": "/{symbol_id}/quotes", "summary": "Quote for a single symbol"},
            {"method": "GET", "path": "/pricehistory", "summary": "OHLCV price history"},
            {"method": "GET", "path": "/movers/{symbol_id}", "summary": "Top movers for an index"},
            {"method": "GET", "path": "/markets", "summary": "Market hours for multiple markets"},
            {"method": "GET", "path": "/instruments", "summary": "Instrument lookup by symbols/projection"},
        ],
        "trader": [
            {"method": "GET", "path": "/accounts/{accountNumber}/orders", "summary": "Orders for one account"},
            {"method": "POST", "path": "/accounts/{accountNumber}/orders", "summary": "Place order"},
            {"method": "DELETE", "path": "/accounts/{accountNumber}/orders/{orderId}", "summary": "Cancel order"},
            {"method": "GET", "path": "/orders", "summary": "Orders for all accounts"},
            {"method": "POST", "path": "/accounts/{accountNumber}/previewOrder", "summary": "Preview order"},
            {"method": "GET", "path": "/accounts/{accountNumber}/transactions", "summary": "Transactions list"},
            {"method": "GET", "path": "/userPreference", "summary": "User preferences"},
        ],
    })
}

pub fn list_tool_contracts() -> Value {
    let tools: serde_json::Map<String, Value> = CONTRACTS
        .iter()
        .map(|(name, contract)| ((*name).to_string(), serde_json::to_value(contract).unwrap()))
        .collect();
    json!({
        "tools": tools,
        "schwab_endpoints": schwab_endpoint_reference(),
    })
}

pub fn get_tool_contract(tool_name: &str) -> Option<Value> {
    CONTRACTS
        .iter()
        .find(|(name, _)| *name == tool_name.trim())
        .map(|(_, contract)| serde_json::to_value(contract).unwrap())
}

fn pick_fields(item: &Value, fields: &[&str]) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(obj) = item.as_object() {
        for field in fields {
            if let Some(value) = obj.get(*field) {
                out.insert((*field).to_string(), value.clone());
            }
        }
    }
    Value::Object(out)
}

fn project_market_hours(raw: &Value) -> Value {
    let Some(markets) = raw.as_object() else {
        return json!([]);
    };
    let mut rows = Vec::new();
    for (market, products) in markets {
        let Some(products) = products.as_object() else {
            continue;
        };
        for (product, detail) in products {
            rows.push(json!({
                "market": market,
                "product": product,
                "is_open": detail.get("is_open"),
                "date": detail.get("date"),
                "session_hours": detail.get("session_hours"),
            }));
        }
    }
    Value::Array(rows)
}

/// Project a raw tool result onto the declared output fields. List tools are
/// truncated to keep downstream prompts bounded.
pub fn project_tool_output(tool_name: &str, raw: &Value) -> Value {
    match tool_name.trim() {
        "get_quote" => pick_fields(
            raw,
            &[
                "symbol", "price", "change", "percent_change", "volume", "open", "high", "low",
                "timestamp", "provider",
            ],
        ),
        "get_historical_prices" => {
            let Some(rows) = raw.as_array() else {
                return json!([]);
            };
            let start = rows.len().saturating_sub(120);
            Value::Array(
                rows[start..]
                    .iter()
                    .map(|row| {
                        pick_fields(row, &["symbol", "date", "open", "high", "low", "close", "volume"])
                    })
                    .collect(),
            )
        }
        "get_company_profile" => pick_fields(
            raw,
            &["symbol", "company", "sector", "industry", "market_cap", "pe", "dividend_yield"],
        ),
        "get_market_movers" => {
            let movers = raw
                .get("movers")
                .and_then(|v| v.as_array())
                .map(|rows| {
                    rows.iter()
                        .take(10)
                        .map(|row| {
                            pick_fields(
                                row,
                                &["symbol", "last_price", "change", "direction", "total_volume"],
                            )
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            json!({
                "index": raw.get("index"),
                "sort": raw.get("sort"),
                "movers": movers,
            })
        }
        "get_stock_news" => {
            let Some(rows) = raw.as_array() else {
                return json!([]);
            };
            Value::Array(
                rows.iter()
                    .take(10)
                    .map(|row| {
                        pick_fields(row, &["headline", "source", "url", "timestamp", "summary", "symbols"])
                    })
                    .collect(),
            )
        }
        "get_market_hours" => project_market_hours(raw),
        // Finviz payloads are already shaped by the client.
        "get_company_overview" | "get_analyst_ratings" | "get_insider_trades" | "get_company_news" => {
            raw.clone()
        }
        _ => raw.clone(),
    }
}

/// Full structured payload recorded per tool call: the projected `output` is
/// the cross-agent contract, `raw` is kept for diagnostics only.
pub fn build_payload(tool_name: &str, input: &Value, raw: &Value) -> Value {
    json!({
        "tool": tool_name,
        "input": input,
        "contract": get_tool_contract(tool_name),
        "output": project_tool_output(tool_name, raw),
        "raw": raw,
    })
}

fn display(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "N/A".to_string(),
        Some(Value::String(s)) if s.is_empty() => "N/A".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
    }
}

/// Compact text rendering of a projected payload for LLM consumption.
pub fn render_payload(payload: &Value) -> String {
    let tool = payload.get("tool").and_then(|v| v.as_str()).unwrap_or("");
    let output = payload.get("output").unwrap_or(&Value::Null);

    match tool {
        "get_quote" => format!(
            "Summary:\n- {}: ${}\n- Change: {} ({}%)\n- Volume: {}\n- Provider: {}",
            display(output.get("symbol")),
            display(output.get("price")),
            display(output.get("change")),
            display(output.get("percent_change")),
            display(output.get("volume")),
            display(output.get("provider")),
        ),
        "get_historical_prices" => {
            let Some(rows) = output.as_array().filter(|r| !r.is_empty()) else {
                return "Summary:\n- No historical price rows returned.".to_string();
            };
            let first = &rows[0];
            let last = &rows[rows.len() - 1];
            format!(
                "Summary:\n- Symbol: {}\n- Window: {} to {}\n- Start close: {}\n- End close: {}\n- Rows: {}",
                display(last.get("symbol")),
                display(first.get("date")),
                display(last.get("date")),
                display(first.get("close")),
                display(last.get("close")),
                rows.len(),
            )
        }
        "get_market_movers" => {
            let movers = output.get("movers").and_then(|v| v.as_array());
            let mut lines = vec![
                "Summary:".to_string(),
                format!("- Index: {}", display(output.get("index"))),
                format!("- Sort: {}", display(output.get("sort"))),
                format!("- Rows: {}", movers.map(|m| m.len()).unwrap_or(0)),
            ];
            if let Some(movers) = movers {
                for row in movers.iter().take(5) {
                    lines.push(format!(
                        "- {}: {} ({})",
                        display(row.get("symbol")),
                        display(row.get("last_price")),
                        display(row.get("change")),
                    ));
                }
            }
            lines.join("\n")
        }
        "get_stock_news" => {
            let Some(rows) = output.as_array().filter(|r| !r.is_empty()) else {
                return "Summary:\n- No news rows returned.".to_string();
            };
            let mut lines = vec!["Summary:".to_string(), format!("- News rows: {}", rows.len())];
            for row in rows.iter().take(5) {
                lines.push(format!(
                    "- {}: {}",
                    display(row.get("source")),
                    display(row.get("headline")),
                ));
            }
            lines.join("\n")
        }
        "get_market_hours" => {
            let Some(rows) = output.as_array().filter(|r| !r.is_empty()) else {
                return "Summary:\n- No market-hours rows returned.".to_string();
            };
            let mut lines = vec![
                "Summary:".to_string(),
                format!("- Market-hour rows: {}", rows.len()),
            ];
            for row in rows.iter().take(5) {
                lines.push(format!(
                    "- {}/{}: is_open={}",
                    display(row.get("market")),
                    display(row.get("product")),
                    display(row.get("is_open")),
                ));
            }
            lines.join("\n")
        }
        "get_company_profile" => format!(
            "Summary:\n- {} | {}\n- Sector: {}\n- Industry: {}\n- Market Cap: {}",
            display(output.get("symbol")),
            display(output.get("company")),
            display(output.get("sector")),
            display(output.get("industry")),
            display(output.get("market_cap")),
        ),
        _ => {
            if output.is_null() {
                "No tool output.".to_string()
            } else {
                output.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_contract_is_retrievable() {
        for name in [
            "get_quote",
            "get_historical_prices",
            "get_company_profile",
            "get_market_movers",
            "get_stock_news",
            "get_market_hours",
            "get_company_overview",
            "get_analyst_ratings",
            "get_insider_trades",
            "get_company_news",
        ] {
            let contract = get_tool_contract(name).unwrap_or_else(|| panic!("{name} missing"));
            assert!(contract["output_fields"].as_array().unwrap().len() >= 4);
        }
        assert!(get_tool_contract("bogus_tool").is_none());
    }

    #[test]
    fn quote_projection_drops_undeclared_fields() {
        let raw = json!({
            "symbol": "AAPL", "price": 212.5, "change": 1.2, "percent_change": 0.5,
            "volume": 123, "open": 210.0, "high": 213.0, "low": 209.0,
            "timestamp": "2025-07-01T20:00:00Z", "provider": "schwab",
            "bid": 212.4, "ask": 212.6, "pe_ratio": 30.0,
        });
        let projected = project_tool_output("get_quote", &raw);
        assert_eq!(projected["symbol"], "AAPL");
        assert!(projected.get("bid").is_none());
        assert!(projected.get("pe_ratio").is_none());
    }

    #[test]
    fn history_projection_caps_rows() {
        let rows: Vec<Value> = (0..200)
            .map(|i| json!({"symbol": "AAPL", "date": format!("d{i}"), "close": i, "extra": true}))
            .collect();
        let projected = project_tool_output("get_historical_prices", &Value::Array(rows));
        let out = projected.as_array().unwrap();
        assert_eq!(out.len(), 120);
        assert_eq!(out[0]["date"], "d80");
        assert!(out[0].get("extra").is_none());
    }

    #[test]
    fn movers_projection_caps_at_ten() {
        let movers: Vec<Value> = (0..15)
            .map(|i| json!({"symbol": format!("S{i}"), "last_price": 1.0, "change": 0.5, "direction": "up"}))
            .collect();
        let raw = json!({"index": "$SPX", "sort": "PERCENT_CHANGE_UP", "movers": movers});
        let projected = project_tool_output("get_market_movers", &raw);
        assert_eq!(projected["movers"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn market_hours_projection_flattens() {
        let raw = json!({
            "equity": {"EQ": {"is_open": true, "date": "2025-07-01", "session_hours": {}}},
            "option": {"EQO": {"is_open": false, "date": "2025-07-01", "session_hours": {}}},
        });
        let projected = project_tool_output("get_market_hours", &raw);
        let rows = projected.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r["market"] == "equity" && r["product"] == "EQ"));
    }

    #[test]
    fn payload_keeps_output_and_raw_separate() {
        let raw = json!({"symbol": "AAPL", "price": 1.0, "secret_diagnostic": 42});
        let payload = build_payload("get_quote", &json!({"symbol": "AAPL"}), &raw);
        assert!(payload["output"].get("secret_diagnostic").is_none());
        assert_eq!(payload["raw"]["secret_diagnostic"], 42);
        assert_eq!(payload["contract"]["source"], "schwab_market_data");
    }

    #[test]
    fn rendering_is_compact() {
        let payload = build_payload(
            "get_historical_prices",
            &json!({"symbol": "MSFT", "days": 5}),
            &json!([
                {"symbol": "MSFT", "date": "2025-06-25", "close": 440.0},
                {"symbol": "MSFT", "date": "2025-07-01", "close": 452.5},
            ]),
        );
        let text = render_payload(&payload);
        assert!(text.contains("Window: 2025-06-25 to 2025-07-01"));
        assert!(text.contains("Rows: 2"));

        let empty = build_payload("get_stock_news", &json!({}), &json!([]));
        assert_eq!(render_payload(&empty), "Summary:\n- No news rows returned.");
    }
}
