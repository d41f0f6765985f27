//! Advisor agent: synthesis of the turn's research plus a deterministic
//! price-move explainer for "why did X move" questions.
//!
//! The explainer bypasses the LLM loop entirely when it matches. It resolves
//! a symbol and horizon from the text, pulls quote/history/news (reusing the
//! market_data result when present), quantifies the net move and any
//! reversal, and emits the three-part markdown answer.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use crate::agents::{
    agent_query, alias_symbol, latest_user_message, market_data, status_for_all, truncate_text,
    AgentContext,
};
use crate::llm::{self, ToolDef};
use crate::models::{AgentName, AgentResult, AgentTask, AgentUpdate, HistoryRow, TaskState};

const ADVISOR_PROMPT: &str = "You are an expert Investment Advisor and Financial Analyst.\n\
Your goal is to provide concise, data-grounded analysis with clear uncertainty.\n\n\
You have access to real-time market data and research context.\n\
When asked for advice or a move-explainer:\n\
1. **Use Evidence First**: Prioritize facts from tools and provided specialist context.\n\
2. **No Unsupported Claims**: If evidence is missing, say so explicitly.\n\
3. **Recency Discipline**: For \"past week\" requests, quantify the move and use dated events from the last 7 calendar days.\n\
4. **Risk Awareness**: Include downside/invalidating factors.\n\n\
If you are asked to buy or sell, you can recommend a thesis, entry zone, and risk controls.\n\
Do not execute any trade.\n\n\
Formatting rules:\n\
- Use a 3-part structure:\n\
  1) Direct answer first line: `**Direct answer:** ...`\n\
  2) Short breakdown using `###` section anchors and bullet points.\n\
  3) End with `**Next step:** ...`\n\
- Bold the core concept of each section.\n\
- Keep output under ~220 words unless user asks for a deep dive.\n\
- Do not output JSON/Python objects.";

lazy_static! {
    static ref HORIZON_DAYS: Regex = Regex::new(r"(?:past|last)\s+(\d{1,3})\s+day").unwrap();
    static ref DOLLAR_TICKER: Regex = Regex::new(r"\$([A-Z]{1,5})\b").unwrap();
    static ref BARE_TICKER: Regex = Regex::new(r"\b([A-Z]{2,5})\b").unwrap();
}

fn advisor_tool_defs() -> Vec<ToolDef> {
    let mut defs = market_data::tool_defs()
        .into_iter()
        .filter(|d| {
            matches!(
                d.name.as_str(),
                "get_company_profile" | "get_quote" | "get_historical_prices" | "get_stock_news"
            )
        })
        .collect::<Vec<_>>();
    defs.push(ToolDef::new(
        "market_context_snapshot",
        "Build a quick market context snapshot from profile + quote + recent history.",
        json!({"type": "object", "properties": {"symbol": {"type": "string"}}, "required": ["symbol"]}),
    ));
    defs
}

pub async fn run(ctx: &AgentContext<'_>, ready: &[AgentTask]) -> Result<AgentUpdate> {
    let query = agent_query(ctx, ready, "Run these advisory requests");
    let user_query = {
        let latest = latest_user_message(ctx.messages);
        if latest.is_empty() {
            query.clone()
        } else {
            latest
        }
    };

    let mut update = AgentUpdate::default();
    if let Some(result) = price_move_explainer(ctx, &user_query).await {
        let state = if result.error.is_some() {
            TaskState::Failed
        } else {
            TaskState::Completed
        };
        update.task_status.extend(status_for_all(ready, state));
        update.agent_results.insert(AgentName::Advisor, result);
        return Ok(update);
    }

    // LLM synthesis over the specialist context from this run.
    let context = specialist_context(ctx);
    let advisor_query = if context.is_empty() {
        query.clone()
    } else {
        format!(
            "User request:\n{query}\n\nSpecialist context from this run:\n{context}\n\n\
             Use this context first, then call tools only if needed to fill critical gaps."
        )
    };

    let mut messages = vec![llm::user_message(&advisor_query)];
    let mut response = ctx
        .deps
        .llm
        .create_message(
            &crate::config::SETTINGS.analysis_model,
            ADVISOR_PROMPT,
            &messages,
            Some(&advisor_tool_defs()),
            1500,
        )
        .await?;

    let mut tool_results = Vec::new();
    let tool_uses: Vec<(String, String, Value)> = response
        .tool_uses()
        .into_iter()
        .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
        .collect();
    if !tool_uses.is_empty() {
        for (id, name, input) in &tool_uses {
            ctx.events.tool_start(name);
            let raw = execute_advisor_tool(ctx, name, input).await;
            ctx.events.tool_end(name);
            let symbol = input
                .get("symbol")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_uppercase();
            tool_results.push(json!({"tool": name, "symbol": symbol}));
            messages.push(llm::assistant_tool_use_message(id, name, input));
            messages.push(llm::tool_result_message(id, &raw.to_string()));
        }
        response = ctx
            .deps
            .llm
            .create_message(
                &crate::config::SETTINGS.analysis_model,
                ADVISOR_PROMPT,
                &messages,
                Some(&advisor_tool_defs()),
                1500,
            )
            .await?;
    }

    update.task_status.extend(status_for_all(ready, TaskState::Completed));
    update.agent_results.insert(
        AgentName::Advisor,
        AgentResult {
            agent: AgentName::Advisor,
            content: response.text(),
            symbols: Vec::new(),
            data: Some(json!({ "tool_results": tool_results })),
            error: None,
        },
    );
    Ok(update)
}

async fn execute_advisor_tool(ctx: &AgentContext<'_>, name: &str, input: &Value) -> Value {
    if name == "market_context_snapshot" {
        let symbol = input.get("symbol").and_then(|v| v.as_str()).unwrap_or("");
        let profile = ctx.deps.market.company_profile(symbol).await;
        let quote = ctx.deps.market.quote(symbol).await;
        let history = ctx.deps.market.history(symbol, 10).await;
        return json!({
            "profile": profile,
            "quote": quote,
            "history_points": history.len(),
        });
    }
    market_data::execute_tool(ctx, name, input).await
}

fn specialist_context(ctx: &AgentContext<'_>) -> String {
    let mut lines = Vec::new();
    for (agent, result) in ctx.agent_results {
        let content = result.content.trim();
        if content.is_empty() {
            continue;
        }
        lines.push(format!("- {}: {}", agent.as_str(), truncate_text(content, 700)));
    }
    lines.join("\n")
}

// ── Price-move explainer ──────────────────────────────────

pub fn is_price_move_query(query: &str) -> bool {
    let q = query.to_lowercase();
    let movement = [
        "go up", "went up", "up in price", "price increase", "surge", "jump", "rally", "rise",
        "drop", "down",
    ];
    let intent = ["why", "what caused", "what drove", "reason", "factor", "contributing", "explain"];
    let horizon = ["past week", "last week", "this week", "recently", "past", "last", "days", "day"];
    let has_motion = movement.iter().any(|m| q.contains(m));
    let has_intent = intent.iter().any(|w| q.contains(w));
    let has_horizon = horizon.iter().any(|h| q.contains(h));
    (has_motion && has_intent) || (has_motion && has_horizon)
}

pub fn extract_horizon_days(query: &str) -> u32 {
    let q = query.to_lowercase();
    if let Some(cap) = HORIZON_DAYS.captures(&q) {
        if let Ok(n) = cap[1].parse::<u32>() {
            return n.clamp(1, 90);
        }
    }
    if q.contains("past week") || q.contains("last week") || q.contains("this week") {
        return 7;
    }
    if q.contains("past month") || q.contains("last month") {
        return 30;
    }
    7
}

fn horizon_label(days: u32) -> String {
    if days == 1 {
        "the last 1 trading day".to_string()
    } else {
        format!("the last {days} trading days")
    }
}

/// Symbol resolution: explicit `$TICKER`, bare ticker, company alias, then
/// the first symbol any peer agent surfaced this run.
pub fn resolve_symbol(query: &str, ctx: &AgentContext<'_>) -> String {
    if let Some(cap) = DOLLAR_TICKER.captures(query) {
        return cap[1].to_uppercase();
    }
    if let Some(cap) = BARE_TICKER.captures(query) {
        return cap[1].to_uppercase();
    }
    if let Some(ticker) = alias_symbol(query) {
        return ticker.to_string();
    }
    for result in ctx.agent_results.values() {
        if let Some(first) = result.symbols.first() {
            return first.to_uppercase();
        }
    }
    String::new()
}

#[derive(Debug, Clone)]
pub struct RecentMove {
    pub start_date: String,
    pub end_date: String,
    pub start_close: f64,
    pub end_close: f64,
    pub pct_change: f64,
}

pub fn compute_recent_move(history: &[HistoryRow], horizon_days: u32) -> Option<RecentMove> {
    if history.len() < 2 {
        return None;
    }
    let needed = (horizon_days as usize + 1).max(2);
    let start_idx = history.len().saturating_sub(needed);
    let window = &history[start_idx..];
    let start = window.first()?;
    let end = window.last()?;
    if start.close == 0.0 {
        return None;
    }
    Some(RecentMove {
        start_date: start.date.chars().take(10).collect(),
        end_date: end.date.chars().take(10).collect(),
        start_close: start.close,
        end_close: end.close,
        pct_change: (end.close - start.close) / start.close * 100.0,
    })
}

#[derive(Debug, Clone, Default)]
pub struct ReversalSnapshot {
    pub has_reversal: bool,
    pub peak_date: String,
    pub peak_close: f64,
    pub start_to_peak_pct: f64,
    pub peak_to_end_pct: f64,
}

pub fn compute_reversal_snapshot(history: &[HistoryRow], horizon_days: u32) -> ReversalSnapshot {
    let needed = (horizon_days as usize + 1).max(2);
    let start_idx = history.len().saturating_sub(needed);
    let window = &history[start_idx..];
    if window.len() < 3 {
        return ReversalSnapshot::default();
    }
    let start = &window[0];
    let end = &window[window.len() - 1];
    let peak = window
        .iter()
        .max_by(|a, b| a.close.partial_cmp(&b.close).unwrap_or(std::cmp::Ordering::Equal))
        .expect("non-empty window");
    if start.close <= 0.0 || peak.close <= 0.0 {
        return ReversalSnapshot::default();
    }
    let start_to_peak_pct = (peak.close - start.close) / start.close * 100.0;
    let peak_to_end_pct = (end.close - peak.close) / peak.close * 100.0;
    ReversalSnapshot {
        has_reversal: start_to_peak_pct > 0.5 && peak_to_end_pct < -0.5,
        peak_date: peak.date.chars().take(10).collect(),
        peak_close: peak.close,
        start_to_peak_pct,
        peak_to_end_pct,
    }
}

fn is_stale_date(date_text: &str, max_age_days: i64) -> bool {
    let head: String = date_text.chars().take(10).collect();
    let Ok(date) = NaiveDate::parse_from_str(&head, "%Y-%m-%d") else {
        return true;
    };
    (Utc::now().date_naive() - date).num_days() > max_age_days
}

fn history_from_market_data(ctx: &AgentContext<'_>) -> Vec<HistoryRow> {
    let Some(result) = ctx.agent_results.get(&AgentName::MarketData) else {
        return Vec::new();
    };
    let Some(ref data) = result.data else {
        return Vec::new();
    };
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
    for key in ["output", "raw"] {
        if let Some(value) = data.get(key) {
            let rows = rows_from(value);
            if !rows.is_empty() {
                return rows;
            }
        }
    }
    Vec::new()
}

fn sentiment_snippet(ctx: &AgentContext<'_>, symbol: &str) -> String {
    let Some(result) = ctx.agent_results.get(&AgentName::Sentiment) else {
        return String::new();
    };
    let text: String = result.content.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return String::new();
    }
    if !symbol.is_empty() && !text.to_uppercase().contains(&symbol.to_uppercase()) {
        return "No stock-specific social sentiment signal found in this run.".to_string();
    }
    truncate_text(&text, 180)
}

fn confidence_label(
    move_available: bool,
    news_count: usize,
    sentiment: &str,
    stale: bool,
    horizon_label: &str,
) -> String {
    if stale {
        return format!("Low (stale price history for {horizon_label} attribution)");
    }
    let mut score = 0;
    if move_available {
        score += 1;
    }
    if news_count >= 2 {
        score += 1;
    }
    if !sentiment.is_empty() {
        score += 1;
    }
    match score {
        3 => "Medium-High (price move + multiple headlines + sentiment signals)".to_string(),
        2 => "Medium (partial evidence across price and catalyst data)".to_string(),
        _ => "Low-Medium (limited supporting evidence from available feeds)".to_string(),
    }
}

async fn price_move_explainer(ctx: &AgentContext<'_>, query: &str) -> Option<AgentResult> {
    if !is_price_move_query(query) {
        return None;
    }
    let symbol = resolve_symbol(query, ctx);
    if symbol.is_empty() {
        return None;
    }

    let horizon_days = extract_horizon_days(query);
    let label = horizon_label(horizon_days);

    ctx.events.tool_start("get_quote");
    let quote = ctx.deps.market.quote(&symbol).await;
    ctx.events.tool_end("get_quote");

    let mut history = history_from_market_data(ctx);
    if history.is_empty() {
        ctx.events.tool_start("get_historical_prices");
        history = ctx
            .deps
            .market
            .history(&symbol, (horizon_days + 8).max(15))
            .await;
        ctx.events.tool_end("get_historical_prices");
    }
    ctx.events.tool_start("get_stock_news");
    let news = ctx.deps.market.stock_news(Some(&symbol), 6).await;
    ctx.events.tool_end("get_stock_news");

    let recent_move = compute_recent_move(&history, horizon_days);
    let stale = match recent_move {
        Some(ref m) => is_stale_date(&m.end_date, (horizon_days as i64 + 1).clamp(3, 10)),
        None => true,
    };
    let reversal = compute_reversal_snapshot(&history, horizon_days);
    let sentiment = sentiment_snippet(ctx, &symbol);

    let answer = match recent_move {
        None => format!(
            "I couldn't compute a reliable move for {symbol} over {label} from available price history. \
             I can summarize headlines, but the exact move pattern is uncertain."
        ),
        Some(ref m) if stale => format!(
            "I can't reliably explain {symbol} over {label} because the latest history point is {}, \
             which is stale for this attribution window.",
            m.end_date
        ),
        Some(ref m) => {
            let q = query.to_lowercase();
            let asks_up_then_drop = (q.contains("up") || q.contains("rise"))
                && (q.contains("drop") || q.contains("fell") || q.contains("down"));
            if asks_up_then_drop && reversal.has_reversal {
                format!(
                    "{symbol} did rise and then drop over {label}: it moved up into {} and then pulled \
                     back about {:.1}% into the latest close.",
                    reversal.peak_date,
                    reversal.peak_to_end_pct.abs()
                )
            } else if q.contains("up") && m.pct_change < 0.0 {
                format!(
                    "Available data does not show {symbol} up over {label}; it shows about {:.1}% down.",
                    m.pct_change.abs()
                )
            } else {
                let direction = if m.pct_change >= 0.0 { "up" } else { "down" };
                format!(
                    "{symbol} is {direction} about {:.1}% over {label} in available data; the move \
                     appears tied to a mix of news flow and sentiment, not one single confirmed catalyst.",
                    m.pct_change.abs()
                )
            }
        }
    };

    // Price Action table rows.
    let mut price_rows: Vec<(String, String)> = Vec::new();
    if let Some(ref m) = recent_move {
        price_rows.push(("Window".into(), format!("{} to {}", m.start_date, m.end_date)));
        price_rows.push((
            "Net move".into(),
            format!(
                "${:.2} -> ${:.2} ({:+.1}%)",
                m.start_close, m.end_close, m.pct_change
            ),
        ));
    }
    if reversal.has_reversal {
        price_rows.push((
            "Reversal".into(),
            format!(
                "Peak {} at ${:.2}, then {:+.1}%",
                reversal.peak_date, reversal.peak_close, reversal.peak_to_end_pct
            ),
        ));
    }
    let latest_price = quote.as_ref().and_then(|q| q.price);
    if let Some(price) = latest_price {
        price_rows.push(("Latest quote".into(), format!("${price:.2}")));
    }
    if stale {
        if let Some(ref m) = recent_move {
            price_rows.push(("Data freshness".into(), format!("Stale (latest bar {})", m.end_date)));
        }
    }

    let mut drivers = Vec::new();
    for item in news.iter().take(3) {
        let headline = item.headline.as_deref().unwrap_or("").trim().to_string();
        if headline.is_empty() {
            continue;
        }
        let source = item.source.as_deref().filter(|s| !s.is_empty()).unwrap_or("source n/a");
        let date_part = item
            .timestamp
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| t.chars().take(10).collect::<String>())
            .unwrap_or_else(|| "date n/a".to_string());
        drivers.push(format!("{date_part} ({source}): {headline}"));
    }
    if drivers.is_empty() {
        drivers.push("No company-specific news headlines were returned by the connected feed.".to_string());
    }

    let mut lines = vec![format!("**Direct answer:** {answer}"), String::new()];
    if !price_rows.is_empty() {
        lines.push("### Price Action".into());
        lines.push(String::new());
        lines.push("| Metric | Value |".into());
        lines.push("|---|---|".into());
        for (metric, value) in &price_rows {
            lines.push(format!("| **{metric}** | {} |", value.replace('|', "\\|")));
        }
        lines.push(String::new());
    }
    lines.push("### Likely Drivers".into());
    lines.push(String::new());
    for driver in &drivers {
        lines.push(format!("- **Catalyst:** {driver}"));
    }
    if !sentiment.is_empty() {
        lines.push(format!("- **Sentiment check:** {sentiment}"));
    }
    lines.extend([
        String::new(),
        "### Risk & Confidence".into(),
        String::new(),
        "- **Counterpoint:** Short-term moves can be flow-driven and reverse quickly if volume fades."
            .into(),
        format!(
            "- **Confidence:** {}.",
            confidence_label(recent_move.is_some(), news.len(), &sentiment, stale, &label)
        ),
        "- **Method note:** Attribution here is correlation-based from available tools, not proof of causation."
            .into(),
        String::new(),
        "**Next step:** Want a catalyst probability breakdown with a trade plan (entry, invalidation, stop)?"
            .into(),
    ]);

    Some(AgentResult {
        agent: AgentName::Advisor,
        content: lines.join("\n").trim().to_string(),
        symbols: vec![symbol.clone()],
        data: Some(json!({
            "tool_results": [
                {"tool": "get_quote", "symbol": symbol},
                {"tool": "get_historical_prices", "symbol": symbol},
                {"tool": "get_stock_news", "symbol": symbol},
            ],
            "quote": quote,
            "history_points": history.len(),
            "news_count": news.len(),
        })),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(closes: &[(&str, f64)]) -> Vec<HistoryRow> {
        closes
            .iter()
            .map(|(date, close)| HistoryRow {
                symbol: "TSLA".into(),
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
    fn price_move_trigger_patterns() {
        assert!(is_price_move_query("Why did TSLA drop this past week?"));
        assert!(is_price_move_query("TSLA surge last 10 days"));
        assert!(is_price_move_query("what caused the rally"));
        assert!(!is_price_move_query("What is the P/E of TSLA?"));
        assert!(!is_price_move_query("Build me a dividend portfolio"));
    }

    #[test]
    fn horizon_extraction() {
        assert_eq!(extract_horizon_days("past 14 days move"), 14);
        assert_eq!(extract_horizon_days("why did it drop last week"), 7);
        assert_eq!(extract_horizon_days("down over the past month"), 30);
        assert_eq!(extract_horizon_days("why the drop"), 7);
        assert_eq!(extract_horizon_days("past 500 days"), 90);
    }

    #[test]
    fn recent_move_math() {
        let history = rows(&[
            ("2025-07-21", 100.0),
            ("2025-07-22", 104.0),
            ("2025-07-23", 108.0),
            ("2025-07-24", 103.0),
            ("2025-07-25", 95.0),
        ]);
        let m = compute_recent_move(&history, 4).unwrap();
        assert_eq!(m.start_date, "2025-07-21");
        assert_eq!(m.end_date, "2025-07-25");
        assert!((m.pct_change - -5.0).abs() < 1e-9);
        assert!(compute_recent_move(&rows(&[("2025-07-25", 10.0)]), 7).is_none());
    }

    #[test]
    fn reversal_detection() {
        let history = rows(&[
            ("2025-07-21", 100.0),
            ("2025-07-22", 104.0),
            ("2025-07-23", 108.0),
            ("2025-07-24", 103.0),
            ("2025-07-25", 95.0),
        ]);
        let r = compute_reversal_snapshot(&history, 4);
        assert!(r.has_reversal);
        assert_eq!(r.peak_date, "2025-07-23");
        assert!(r.start_to_peak_pct > 0.5);
        assert!(r.peak_to_end_pct < -0.5);

        let flat = rows(&[("2025-07-21", 100.0), ("2025-07-22", 100.0), ("2025-07-23", 100.0)]);
        assert!(!compute_reversal_snapshot(&flat, 4).has_reversal);
    }

    #[test]
    fn stale_date_boundaries() {
        let fresh = (Utc::now().date_naive() - chrono::Duration::days(3))
            .format("%Y-%m-%d")
            .to_string();
        assert!(!is_stale_date(&fresh, 7));
        let old = (Utc::now().date_naive() - chrono::Duration::days(20))
            .format("%Y-%m-%d")
            .to_string();
        assert!(is_stale_date(&old, 7));
        assert!(is_stale_date("garbage", 7));
    }

    #[test]
    fn confidence_tiers() {
        assert!(confidence_label(true, 3, "bullish chatter", false, "the last 7 trading days")
            .starts_with("Medium-High"));
        assert!(confidence_label(true, 2, "", false, "w").starts_with("Medium"));
        assert!(confidence_label(false, 0, "", false, "w").starts_with("Low-Medium"));
        assert!(confidence_label(true, 3, "s", true, "the last 7 trading days").starts_with("Low ("));
    }
}
