//! Valuation builders: the DCF memo and the pre-earnings brief.

use anyhow::{bail, Result};
use serde_json::{json, Value};

use crate::models::now_iso;
use crate::reports::helpers::*;
use crate::state::AppDeps;

/// Five-year FCF projection discounted at a macro-derived WACC, averaged
/// perpetuity/exit-multiple terminal values, and a rate×growth sensitivity
/// grid.
pub async fn build_morgan_dcf(deps: &AppDeps, payload: &Value) -> Result<Value> {
    let Some(ticker) = extract_ticker(payload) else {
        bail!("Ticker is required for DCF report.");
    };

    let ctx = load_stock_context(deps, &ticker, false).await;
    let overview = &ctx.overview;
    let current_price = ctx.quote.as_ref().and_then(|q| q.price).unwrap_or(0.0);
    let market_cap = safe_float(overview.get("market_cap")).unwrap_or(current_price * 1e9);

    let revenue_base =
        safe_float(overview.get("revenue")).unwrap_or_else(|| (market_cap * 0.25).max(1e9));
    let sales_growth = safe_pct(overview.get("sales_past_5y"))
        .or_else(|| safe_pct(overview.get("eps_next_y")))
        .unwrap_or(0.08);
    let op_margin = safe_pct(overview.get("oper_margin")).unwrap_or(0.2);
    let beta = safe_float(overview.get("beta")).unwrap_or(1.0);

    let macro_ind = deps.fred.get_key_indicators().await;
    let rf = macro_ind
        .get("10y_treasury")
        .and_then(|i| i.value)
        .unwrap_or(4.0)
        / 100.0;
    let equity_risk_premium = 0.05;
    let wacc = (rf + beta * equity_risk_premium).clamp(0.07, 0.16);
    let gdp = macro_ind.get("gdp").and_then(|i| i.value).unwrap_or(2.0);
    let terminal_growth = (gdp / 1000.0).clamp(0.02, 0.03);

    let mut projections = Vec::new();
    let mut revenue = revenue_base;
    for year in 1..=5u32 {
        let growth = (sales_growth - (year as f64 - 1.0) * 0.01).max(0.02);
        revenue *= 1.0 + growth;
        let ebit = revenue * op_margin;
        let nopat = ebit * (1.0 - 0.21);
        let reinvestment = nopat * 0.35;
        let fcf = nopat - reinvestment;
        let pv = fcf / (1.0 + wacc).powi(year as i32);
        projections.push(json!({
            "year": year,
            "growth": growth,
            "revenue": revenue,
            "op_margin": op_margin,
            "fcf": fcf,
            "pv_fcf": pv,
        }));
    }

    let fcf5 = projections[4]["fcf"].as_f64().unwrap_or(0.0);
    let revenue5 = projections[4]["revenue"].as_f64().unwrap_or(0.0);
    let terminal_perpetuity = fcf5 * (1.0 + terminal_growth) / (wacc - terminal_growth);
    let exit_multiple = 14.0;
    let terminal_exit = revenue5 * op_margin * exit_multiple;
    let discount5 = (1.0 + wacc).powi(5);
    let pv_terminal = (terminal_perpetuity / discount5 + terminal_exit / discount5) / 2.0;
    let enterprise_value = projections
        .iter()
        .map(|p| p["pv_fcf"].as_f64().unwrap_or(0.0))
        .sum::<f64>()
        + pv_terminal;

    let mut sensitivity = Vec::new();
    for dr in [wacc - 0.01, wacc, wacc + 0.01] {
        for tg in [terminal_growth - 0.005, terminal_growth, terminal_growth + 0.005] {
            if dr <= tg {
                continue;
            }
            let tv = fcf5 * (1.0 + tg) / (dr - tg);
            let ev: f64 = projections
                .iter()
                .map(|p| {
                    let fcf = p["fcf"].as_f64().unwrap_or(0.0);
                    let year = p["year"].as_i64().unwrap_or(1) as i32;
                    fcf / (1.0 + dr).powi(year)
                })
                .sum::<f64>()
                + tv / (1.0 + dr).powi(5);
            sensitivity.push(json!({"discount_rate": dr, "terminal_growth": tg, "fair_value": ev}));
        }
    }

    let verdict = if enterprise_value > market_cap * 1.1 {
        "undervalued"
    } else if enterprise_value < market_cap * 0.9 {
        "overvalued"
    } else {
        "fairly valued"
    };

    let projection_table = markdown_table(
        &["Year", "Revenue", "Growth", "Op Margin", "FCF", "PV FCF"],
        &projections
            .iter()
            .map(|p| {
                vec![
                    p["year"].to_string(),
                    fmt_num(p["revenue"].as_f64(), 0),
                    fmt_pct(p["growth"].as_f64(), 1),
                    fmt_pct(p["op_margin"].as_f64(), 1),
                    fmt_num(p["fcf"].as_f64(), 0),
                    fmt_num(p["pv_fcf"].as_f64(), 0),
                ]
            })
            .collect::<Vec<_>>(),
    );
    let sensitivity_table = markdown_table(
        &["Discount Rate", "Terminal Growth", "Fair Value (EV)"],
        &sensitivity
            .iter()
            .take(9)
            .map(|s| {
                vec![
                    fmt_pct(s["discount_rate"].as_f64(), 1),
                    fmt_pct(s["terminal_growth"].as_f64(), 1),
                    fmt_num(s["fair_value"].as_f64(), 0),
                ]
            })
            .collect::<Vec<_>>(),
    );
    let catalyst_rows: Vec<Vec<String>> = ctx
        .headlines
        .iter()
        .take(4)
        .map(|h| {
            vec![
                h["title"].as_str().unwrap_or("N/A").to_string(),
                h["source"].as_str().unwrap_or("N/A").to_string(),
            ]
        })
        .collect();
    let catalyst_table = if catalyst_rows.is_empty() {
        markdown_table(&["Headline", "Source"], &[vec!["N/A".into(), "N/A".into()]])
    } else {
        markdown_table(&["Headline", "Source"], &catalyst_rows)
    };

    let markdown = [
        format!("# Morgan Stanley DCF Memo: {ticker}"),
        String::new(),
        format!("Current market cap (proxy): ${}", fmt_num(Some(market_cap), 0)),
        format!("Model EV: ${}", fmt_num(Some(enterprise_value), 0)),
        format!("Verdict: **{}**", verdict.to_uppercase()),
        String::new(),
        "## 5-Year Projection".into(),
        projection_table,
        String::new(),
        "## Sensitivity".into(),
        sensitivity_table,
        String::new(),
        "## Recent Catalysts".into(),
        catalyst_table,
    ]
    .join("\n");

    Ok(json!({
        "report_type": "morgan_dcf",
        "title": "Morgan Stanley DCF Valuation",
        "generated_at": now_iso(),
        "data": {
            "ticker": ticker,
            "wacc": wacc,
            "terminal_growth": terminal_growth,
            "enterprise_value": enterprise_value,
            "market_cap_proxy": market_cap,
            "verdict": verdict,
            "projections": projections,
            "sensitivity": sensitivity,
            "subagent_trace": ctx.subagent_trace,
        },
        "markdown": markdown,
        "assumptions": [
            "FCF derived from operating margin and a fixed reinvestment ratio.",
            "Market cap and revenue may be proxy-derived when fields are missing.",
        ],
        "limitations": [
            "Share-count-level intrinsic value per share is not computed without a reliable share count source.",
        ],
        "sources_used": default_sources("morgan_dcf"),
    }))
}

/// Beat/miss headline signal + volatility-proxy implied move folded into a
/// buy-before / sell-before / wait decision.
pub async fn build_jpm_earnings(deps: &AppDeps, payload: &Value) -> Result<Value> {
    let Some(ticker) = extract_ticker(payload) else {
        bail!("Ticker is required for earnings analysis.");
    };

    let ctx = load_stock_context(deps, &ticker, false).await;
    let overview = &ctx.overview;
    let empty = Vec::new();
    let news = ctx.news.get("news").and_then(|v| v.as_array()).unwrap_or(&empty);
    let ratings = ctx.ratings.get("ratings").and_then(|v| v.as_array()).unwrap_or(&empty);

    let mut beat_count = 0usize;
    let mut miss_count = 0usize;
    for item in news.iter().take(10) {
        let title = item
            .get("headline")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_lowercase();
        if title.contains("beat") {
            beat_count += 1;
        } else if title.contains("miss") {
            miss_count += 1;
        }
    }

    let returns = daily_returns(&ctx.history);
    let vol = if returns.len() > 10 {
        population_std_dev(&returns)
    } else {
        0.02
    };
    let current_price = ctx.quote.as_ref().and_then(|q| q.price).unwrap_or(0.0);
    let implied_move_proxy = current_price * vol * 1.5;

    let eps_next_y = safe_pct(overview.get("eps_next_y")).unwrap_or(0.0);
    let bullish = beat_count >= miss_count && eps_next_y > 0.0;
    let pct_change = ctx.quote.as_ref().and_then(|q| q.percent_change).unwrap_or(0.0);
    let recommended_play = if bullish && pct_change > -2.0 {
        "buy before"
    } else if !bullish {
        "sell before"
    } else {
        "wait"
    };

    let sentiment_label = ctx
        .web_sentiment
        .as_ref()
        .map(|s| s.news_sentiment.clone())
        .unwrap_or_else(|| "N/A".to_string());

    let metrics_table = markdown_table(
        &["Metric", "Value"],
        &[
            vec![
                "Beat/Miss signal from recent headlines".into(),
                format!("{beat_count} beats / {miss_count} misses"),
            ],
            vec![
                "Consensus EPS proxy (next Y field)".into(),
                overview
                    .get("eps_next_y")
                    .and_then(|v| v.as_str())
                    .unwrap_or("N/A")
                    .to_string(),
            ],
            vec!["News sentiment".into(), sentiment_label.clone()],
            vec!["Current Price".into(), format!("${}", fmt_num(Some(current_price), 2))],
            vec![
                "Bull case target (+8%)".into(),
                format!("${}", fmt_num(Some(current_price * 1.08), 2)),
            ],
            vec![
                "Bear case target (-10%)".into(),
                format!("${}", fmt_num(Some(current_price * 0.90), 2)),
            ],
        ],
    );
    let headline_rows: Vec<Vec<String>> = ctx
        .headlines
        .iter()
        .take(4)
        .map(|h| {
            vec![
                h["title"].as_str().unwrap_or("N/A").to_string(),
                h["source"].as_str().unwrap_or("N/A").to_string(),
            ]
        })
        .collect();
    let headline_table = if headline_rows.is_empty() {
        markdown_table(&["Headline", "Source"], &[vec!["N/A".into(), "N/A".into()]])
    } else {
        markdown_table(&["Headline", "Source"], &headline_rows)
    };

    let markdown = [
        format!("# JPMorgan Pre-Earnings Brief: {ticker}"),
        String::new(),
        format!("Decision summary: **{}**", recommended_play.to_uppercase()),
        format!(
            "Implied move proxy (1-day): **${}**",
            fmt_num(Some(implied_move_proxy), 2)
        ),
        String::new(),
        metrics_table,
        String::new(),
        "## Headlines In Focus".into(),
        headline_table,
    ]
    .join("\n");

    Ok(json!({
        "report_type": "jpm_earnings",
        "title": "JPMorgan Earnings Analyzer",
        "generated_at": now_iso(),
        "data": {
            "ticker": ticker,
            "recent_beat_count": beat_count,
            "recent_miss_count": miss_count,
            "consensus_eps_proxy": overview.get("eps_next_y"),
            "implied_move_proxy": implied_move_proxy,
            "historical_reaction_proxy": vol,
            "recommended_play": recommended_play,
            "ratings_sample": ratings.iter().take(4).collect::<Vec<_>>(),
            "headlines": ctx.headlines.iter().take(6).collect::<Vec<_>>(),
            "news_sentiment": ctx.web_sentiment,
            "subagent_trace": ctx.subagent_trace,
        },
        "markdown": markdown,
        "assumptions": [
            "Earnings beat/miss history is inferred from headline text when official estimate history is unavailable.",
        ],
        "limitations": [
            "Options-implied move is a volatility proxy, not live options-chain IV.",
        ],
        "sources_used": default_sources("jpm_earnings"),
    }))
}

#[cfg(test)]
mod tests {
    // Builder math that doesn't need the network lives in helpers; the
    // builders themselves are exercised through the engine integration tests
    // with stubbed payloads.
    use super::*;

    #[tokio::test]
    async fn dcf_requires_a_ticker() {
        let deps = crate::state::AppDeps::for_tests();
        let err = build_morgan_dcf(&deps, &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Ticker is required"));
    }

    #[tokio::test]
    async fn earnings_requires_a_ticker() {
        let deps = crate::state::AppDeps::for_tests();
        let err = build_jpm_earnings(&deps, &json!({"limit": 3})).await.unwrap_err();
        assert!(err.to_string().contains("Ticker is required"));
    }
}
