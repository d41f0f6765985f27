//! Shared report-builder helpers: numeric parsing of scraped fields, markdown
//! tables, return statistics, and the parallel sub-agent fan-out that loads a
//! full stock context under one timeout.

use std::time::Duration;

use serde_json::{json, Value};
use statrs::statistics::Statistics;
use tracing::warn;

use crate::models::{HistoryRow, Quote};
use crate::providers::tavily::{NewsSentiment, SearchResult};
use crate::state::AppDeps;

pub const SUBAGENT_TIMEOUT: Duration = Duration::from_secs(25);

pub const DEFAULT_SCREEN_UNIVERSE: [&str; 30] = [
    "AAPL", "MSFT", "NVDA", "AMZN", "GOOGL", "META", "AVGO", "TSLA", "JPM", "V", "MA", "UNH",
    "XOM", "LLY", "HD", "COST", "ABBV", "PFE", "KO", "PEP", "PG", "MRK", "CSCO", "ORCL", "CRM",
    "AMD", "NFLX", "INTU", "ADBE", "TXN",
];

pub const DEFAULT_DIVIDEND_UNIVERSE: [&str; 20] = [
    "JNJ", "PG", "KO", "PEP", "ABBV", "XOM", "CVX", "T", "VZ", "IBM", "MMM", "MCD", "MO", "PM",
    "HD", "LOW", "DUK", "SO", "NEE", "BMY",
];

pub fn sector_competitors(sector: &str) -> Vec<&'static str> {
    match sector {
        "semiconductors" | "semiconductor" => vec!["NVDA", "AMD", "AVGO", "QCOM", "INTC", "TXN"],
        "ai infrastructure" => vec!["NVDA", "MSFT", "AMZN", "GOOGL", "META", "AMD"],
        "banking" | "finance" => vec!["JPM", "BAC", "WFC", "C", "GS", "MS"],
        "energy" => vec!["XOM", "CVX", "COP", "SLB", "EOG", "PSX"],
        "healthcare" => vec!["LLY", "JNJ", "PFE", "MRK", "ABBV", "BMY"],
        _ => vec!["AAPL", "MSFT", "GOOGL", "AMZN", "META", "NVDA"],
    }
}

// ── Numeric parsing of scraped fields ─────────────────────

/// Parse a Finviz-style field ("3.21T", "1,234.5", "12.3%", "$45") to f64.
pub fn safe_float(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    let text = value.as_str()?.trim();
    if text.is_empty() || matches!(text, "N/A" | "-" | "--" | "None" | ".") {
        return None;
    }
    let mut text = text.replace(',', "").replace('$', "");
    if text.ends_with('%') {
        text.pop();
    }
    let mut suffix = 1.0;
    if let Some(last) = text.chars().last() {
        suffix = match last {
            'T' => 1e12,
            'B' => 1e9,
            'M' => 1e6,
            'K' => 1e3,
            _ => 1.0,
        };
        if suffix != 1.0 {
            text.pop();
        }
    }
    text.parse::<f64>().ok().map(|n| n * suffix)
}

/// Like `safe_float` but normalizes percent-scale values to fractions.
pub fn safe_pct(value: Option<&Value>) -> Option<f64> {
    let parsed = safe_float(value)?;
    if parsed > 1.0 && parsed <= 100.0 {
        return Some(parsed / 100.0);
    }
    if parsed > 100.0 {
        return Some(parsed / 10_000.0);
    }
    Some(parsed)
}

pub fn fmt_num(value: Option<f64>, ndigits: usize) -> String {
    match value {
        None => "N/A".to_string(),
        Some(v) => {
            let formatted = format!("{v:.ndigits$}");
            // Thousands separators on the integer part.
            let (int_part, frac_part) = match formatted.split_once('.') {
                Some((i, f)) => (i.to_string(), Some(f.to_string())),
                None => (formatted, None),
            };
            let negative = int_part.starts_with('-');
            let digits: Vec<char> = int_part.trim_start_matches('-').chars().collect();
            let mut grouped = String::new();
            for (i, c) in digits.iter().enumerate() {
                if i > 0 && (digits.len() - i) % 3 == 0 {
                    grouped.push(',');
                }
                grouped.push(*c);
            }
            let sign = if negative { "-" } else { "" };
            match frac_part {
                Some(f) => format!("{sign}{grouped}.{f}"),
                None => format!("{sign}{grouped}"),
            }
        }
    }
}

pub fn fmt_pct(value: Option<f64>, ndigits: usize) -> String {
    match value {
        None => "N/A".to_string(),
        Some(v) => format!("{:.ndigits$}%", v * 100.0),
    }
}

pub fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return "No rows.".to_string();
    }
    let mut out = vec![
        format!("| {} |", headers.join(" | ")),
        format!("| {} |", vec!["---"; headers.len()].join(" | ")),
    ];
    for row in rows {
        out.push(format!("| {} |", row.join(" | ")));
    }
    out.join("\n")
}

// ── Return statistics ─────────────────────────────────────

pub fn daily_returns(history: &[HistoryRow]) -> Vec<f64> {
    history
        .windows(2)
        .filter_map(|pair| {
            let prev = pair[0].close;
            (prev > 0.0).then(|| pair[1].close / prev - 1.0)
        })
        .collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| Statistics::mean(values))
}

pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    Statistics::population_std_dev(values)
}

/// Pearson correlation over the overlapping tail of two return series.
pub fn correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 3 {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];
    let mean_a = mean(a)?;
    let mean_b = mean(b)?;
    let num: f64 = a.iter().zip(b).map(|(x, y)| (x - mean_a) * (y - mean_b)).sum();
    let den_a: f64 = a.iter().map(|x| (x - mean_a).powi(2)).sum::<f64>().sqrt();
    let den_b: f64 = b.iter().map(|y| (y - mean_b).powi(2)).sum::<f64>().sqrt();
    if den_a == 0.0 || den_b == 0.0 {
        return None;
    }
    Some(num / (den_a * den_b))
}

// ── Payload parsing ───────────────────────────────────────

pub fn extract_ticker(payload: &Value) -> Option<String> {
    for key in ["ticker", "symbol"] {
        if let Some(t) = payload.get(key).and_then(|v| v.as_str()) {
            if !t.trim().is_empty() {
                return Some(t.trim().to_uppercase());
            }
        }
    }
    if let Some(list) = payload.get("tickers").and_then(|v| v.as_array()) {
        if let Some(first) = list.first().and_then(|v| v.as_str()) {
            return Some(first.to_uppercase());
        }
    }
    for key in ["stock", "company"] {
        if let Some(text) = payload.get(key).and_then(|v| v.as_str()) {
            let token = text.split_whitespace().next().unwrap_or("").to_uppercase();
            if (1..=6).contains(&token.len()) && token.chars().all(|c| c.is_ascii_alphabetic()) {
                return Some(token);
            }
        }
    }
    None
}

// ── Stock context fan-out ─────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StockContext {
    pub symbol: String,
    pub overview: Value,
    pub quote: Option<Quote>,
    pub history: Vec<HistoryRow>,
    pub ratings: Value,
    pub news: Value,
    pub insiders: Value,
    pub web_sentiment: Option<NewsSentiment>,
    pub web_news: Option<SearchResult>,
    pub headlines: Vec<Value>,
    pub macro_snapshot: Value,
    pub subagent_trace: Vec<Value>,
}

fn merge_headlines(news: &Value, web_news: Option<&SearchResult>, limit: usize) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some(items) = news.get("news").and_then(|v| v.as_array()) {
        for item in items.iter().take(limit) {
            out.push(json!({
                "title": item.get("headline").cloned().unwrap_or(Value::String(String::new())),
                "source": item.get("source").cloned().unwrap_or(Value::String("Finviz".into())),
                "url": item.get("link").cloned().unwrap_or(Value::String(String::new())),
            }));
        }
    }
    if out.len() < limit {
        if let Some(web) = web_news {
            for hit in &web.results {
                if out.len() >= limit {
                    break;
                }
                out.push(json!({
                    "title": hit.title,
                    "source": "Web",
                    "url": hit.url,
                }));
            }
        }
    }
    out
}

/// Run the research collectors for one ticker concurrently. The whole gather
/// is bounded by `SUBAGENT_TIMEOUT`; a collector that fails or times out
/// degrades to empty, never fatal.
pub async fn load_stock_context(deps: &AppDeps, symbol: &str, include_macro: bool) -> StockContext {
    let sym = symbol.to_uppercase();
    let outlook_query = format!("{sym} stock outlook");

    let gather = async {
        tokio::join!(
            deps.finviz.get_company_overview(&sym),
            deps.market.quote(&sym),
            deps.market.history(&sym, 365),
            deps.finviz.get_analyst_ratings(&sym),
            deps.finviz.get_company_news(&sym, 12),
            deps.finviz.get_insider_trades(&sym, 12),
            deps.tavily.get_news_sentiment(&sym),
            deps.tavily.search_financial_news(&outlook_query, 5),
            async {
                if include_macro {
                    Some(deps.fred.get_key_indicators().await)
                } else {
                    None
                }
            },
        )
    };

    let (overview, quote, history, ratings, news, insiders, web_sentiment, web_news, macro_ind) =
        match tokio::time::timeout(SUBAGENT_TIMEOUT, gather).await {
            Ok(results) => results,
            Err(_) => {
                warn!(symbol = %sym, "stock context fan-out timed out");
                let names = [
                    "fundamentals", "market_quote", "market_history", "analyst_ratings",
                    "company_news", "insider_trades", "web_sentiment", "web_news",
                ];
                return StockContext {
                    symbol: sym,
                    subagent_trace: names
                        .iter()
                        .map(|n| json!({"agent": n, "status": "timeout"}))
                        .collect(),
                    ..Default::default()
                };
            }
        };

    let trace = vec![
        json!({"agent": "fundamentals", "status": if overview.is_some() { "ok" } else { "empty" }}),
        json!({"agent": "market_quote", "status": if quote.is_some() { "ok" } else { "empty" }}),
        json!({"agent": "market_history", "status": if history.is_empty() { "empty" } else { "ok" }}),
        json!({"agent": "analyst_ratings", "status": if ratings.is_some() { "ok" } else { "empty" }}),
        json!({"agent": "company_news", "status": if news.is_some() { "ok" } else { "empty" }}),
        json!({"agent": "insider_trades", "status": if insiders.is_some() { "ok" } else { "empty" }}),
        json!({"agent": "web_sentiment", "status": if web_sentiment.is_some() { "ok" } else { "empty" }}),
        json!({"agent": "web_news", "status": if web_news.is_some() { "ok" } else { "empty" }}),
    ];

    let news = news.unwrap_or_else(|| json!({}));
    let headlines = merge_headlines(&news, web_news.as_ref(), 4);
    StockContext {
        symbol: sym,
        overview: overview.unwrap_or_else(|| json!({})),
        quote,
        history,
        ratings: ratings.unwrap_or_else(|| json!({})),
        news,
        insiders: insiders.unwrap_or_else(|| json!({})),
        web_sentiment,
        web_news,
        headlines,
        macro_snapshot: macro_ind
            .and_then(|m| serde_json::to_value(m).ok())
            .unwrap_or(Value::Null),
        subagent_trace: trace,
    }
}

// ── Scoring heuristics ────────────────────────────────────

pub fn moat_rating(overview: &Value) -> &'static str {
    let roe = safe_pct(overview.get("roe")).unwrap_or(0.0);
    let margin = safe_pct(overview.get("profit_margin")).unwrap_or(0.0);
    let debt = safe_float(overview.get("debt_eq")).unwrap_or(0.0);
    let score = roe * 100.0 + margin * 100.0 - debt.min(200.0) * 0.05;
    if score >= 30.0 {
        "strong"
    } else if score >= 15.0 {
        "moderate"
    } else {
        "weak"
    }
}

pub fn risk_score(overview: &Value, quote: Option<&Quote>) -> (i32, String) {
    let beta = safe_float(overview.get("beta")).unwrap_or(1.0);
    let debt = safe_float(overview.get("debt_eq")).unwrap_or(0.0);
    let pe = safe_float(overview.get("pe")).unwrap_or(20.0);
    let pct = quote
        .and_then(|q| q.percent_change)
        .map(|p| p.abs())
        .unwrap_or(0.0);
    let score = 3.0 + beta.min(3.0) + (debt / 150.0).min(2.0) + (pe / 40.0).min(2.0) + (pct / 5.0).min(1.0);
    let score_int = (score.round() as i32).clamp(1, 10);
    let reason = format!("beta={beta:.2}, debt/equity={debt:.2}, P/E={pe:.1}, daily move={pct:.2}%");
    (score_int, reason)
}

// ── Tool plan and sources ─────────────────────────────────

pub fn build_tool_plan(report_type: &str, payload: &Value) -> Vec<Value> {
    let mut plan = Vec::new();
    if let Some(ticker) = extract_ticker(payload) {
        plan.push(json!({"tool": "market_data.quote", "reason": format!("Live price anchor for {ticker}")}));
        plan.push(json!({"tool": "market_data.history", "reason": format!("Trend/volatility history for {ticker}")}));
        plan.push(json!({"tool": "finviz.get_company_overview", "reason": format!("Fundamentals for {ticker}")}));
        plan.push(json!({"tool": "finviz.get_analyst_ratings", "reason": format!("Street signals for {ticker}")}));
        plan.push(json!({"tool": "tavily.get_news_sentiment", "reason": format!("Recent narrative/sentiment for {ticker}")}));
    }
    if matches!(report_type, "morgan_dcf" | "mckinsey_macro") {
        plan.push(json!({"tool": "fred.get_key_indicators", "reason": "Macro inputs for discount-rate/cycle assumptions"}));
    }
    if matches!(report_type, "bridgewater_risk" | "blackrock_builder" | "mckinsey_macro") {
        plan.push(json!({"tool": "payload.holdings", "reason": "Portfolio-aware recommendations"}));
    }
    plan
}

pub fn default_sources(report_type: &str) -> Vec<&'static str> {
    match report_type {
        "goldman_screener" => vec!["market_data_provider", "finviz", "tavily_news_sentiment"],
        "morgan_dcf" => vec!["market_data_provider", "finviz", "fred", "tavily_financial_news"],
        "bridgewater_risk" => vec!["portfolio_payload", "market_data_provider", "finviz"],
        "jpm_earnings" => vec![
            "market_data_provider",
            "finviz",
            "tavily_news_sentiment",
            "tavily_financial_news",
        ],
        "blackrock_builder" => vec!["historical_allocation_proxies"],
        "citadel_technical" => vec!["market_data_provider", "technical_analysis"],
        "harvard_dividend" => vec!["finviz", "market_data_provider"],
        "bain_competitive" => vec!["market_data_provider", "finviz", "tavily_financial_news"],
        "renaissance_pattern" => vec!["market_data_provider", "finviz", "tavily_financial_news"],
        "mckinsey_macro" => vec!["fred", "market_data_provider", "portfolio_payload"],
        _ => vec!["market_data_provider", "finviz"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_float_suffixes() {
        assert_eq!(safe_float(Some(&json!("3.2T"))), Some(3.2e12));
        assert_eq!(safe_float(Some(&json!("1.5B"))), Some(1.5e9));
        assert_eq!(safe_float(Some(&json!("250M"))), Some(250e6));
        assert_eq!(safe_float(Some(&json!("12K"))), Some(12e3));
        assert_eq!(safe_float(Some(&json!("1,234.5"))), Some(1234.5));
        assert_eq!(safe_float(Some(&json!("$45.20"))), Some(45.2));
        assert_eq!(safe_float(Some(&json!("12.5%"))), Some(12.5));
        assert_eq!(safe_float(Some(&json!("N/A"))), None);
        assert_eq!(safe_float(Some(&json!(""))), None);
        assert_eq!(safe_float(Some(&json!(2.5))), Some(2.5));
        assert_eq!(safe_float(None), None);
    }

    #[test]
    fn safe_pct_normalizes_scales() {
        assert_eq!(safe_pct(Some(&json!("12.5%"))), Some(0.125));
        assert_eq!(safe_pct(Some(&json!(0.08))), Some(0.08));
        assert_eq!(safe_pct(Some(&json!(450.0))), Some(0.045));
    }

    #[test]
    fn number_formatting() {
        assert_eq!(fmt_num(Some(1234567.891), 0), "1,234,568");
        assert_eq!(fmt_num(Some(12.3456), 2), "12.35");
        assert_eq!(fmt_num(Some(-9876.5), 1), "-9,876.5");
        assert_eq!(fmt_num(None, 2), "N/A");
        assert_eq!(fmt_pct(Some(0.0825), 1), "8.2%");
        assert_eq!(fmt_pct(None, 1), "N/A");
    }

    #[test]
    fn markdown_table_shape() {
        let table = markdown_table(
            &["Ticker", "P/E"],
            &[vec!["AAPL".into(), "33.5".into()], vec!["MSFT".into(), "36.1".into()]],
        );
        assert!(table.starts_with("| Ticker | P/E |"));
        assert!(table.contains("| --- | --- |"));
        assert!(table.contains("| MSFT | 36.1 |"));
        assert_eq!(markdown_table(&["A"], &[]), "No rows.");
    }

    fn history(closes: &[f64]) -> Vec<HistoryRow> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| HistoryRow {
                symbol: "X".into(),
                date: format!("2025-01-{:02}", i + 1),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 1,
            })
            .collect()
    }

    #[test]
    fn daily_returns_math() {
        let returns = daily_returns(&history(&[100.0, 110.0, 99.0]));
        assert_eq!(returns.len(), 2);
        assert!((returns[0] - 0.1).abs() < 1e-12);
        assert!((returns[1] + 0.1).abs() < 1e-12);
    }

    #[test]
    fn correlation_bounds() {
        let a = vec![0.01, -0.02, 0.03, 0.01, -0.01];
        let b = a.clone();
        assert!((correlation(&a, &b).unwrap() - 1.0).abs() < 1e-9);
        let inverted: Vec<f64> = a.iter().map(|v| -v).collect();
        assert!((correlation(&a, &inverted).unwrap() + 1.0).abs() < 1e-9);
        assert!(correlation(&a[..2], &b[..2]).is_none());
        let flat = vec![0.0; 5];
        assert!(correlation(&a, &flat).is_none());
    }

    #[test]
    fn ticker_extraction_paths() {
        assert_eq!(extract_ticker(&json!({"ticker": "pltr"})), Some("PLTR".into()));
        assert_eq!(extract_ticker(&json!({"symbol": "AAPL"})), Some("AAPL".into()));
        assert_eq!(extract_ticker(&json!({"tickers": ["msft", "aapl"]})), Some("MSFT".into()));
        assert_eq!(extract_ticker(&json!({"stock": "NVDA corp analysis"})), Some("NVDA".into()));
        assert_eq!(extract_ticker(&json!({"limit": 10})), None);
    }

    #[test]
    fn moat_and_risk_heuristics() {
        let strong = json!({"roe": "35%", "profit_margin": "28%", "debt_eq": "0.4"});
        assert_eq!(moat_rating(&strong), "strong");
        let weak = json!({"roe": "2%", "profit_margin": "1%", "debt_eq": "180"});
        assert_eq!(moat_rating(&weak), "weak");

        let (score, reason) = risk_score(&json!({"beta": "2.5", "debt_eq": "300", "pe": "80"}), None);
        assert!(score >= 7);
        assert!(reason.contains("beta=2.50"));
        let (calm, _) = risk_score(&json!({"beta": "0.6", "debt_eq": "20", "pe": "14"}), None);
        assert!(calm <= 5);
    }

    #[test]
    fn tool_plans_include_macro_and_portfolio_inputs() {
        let plan = build_tool_plan("morgan_dcf", &json!({"ticker": "AAPL"}));
        assert!(plan.iter().any(|t| t["tool"] == "fred.get_key_indicators"));
        let plan = build_tool_plan("bridgewater_risk", &json!({}));
        assert!(plan.iter().any(|t| t["tool"] == "payload.holdings"));
        assert!(!plan.iter().any(|t| t["tool"] == "market_data.quote"));
    }

    #[test]
    fn sector_universe_lookup() {
        assert_eq!(sector_competitors("semiconductors")[0], "NVDA");
        assert_eq!(sector_competitors("banking")[0], "JPM");
        assert_eq!(sector_competitors("something else")[0], "AAPL");
    }
}
