//! Screener-style builders: the quality screen, the dividend blueprint, and
//! the sector competitive landscape.

use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::models::now_iso;
use crate::reports::helpers::*;
use crate::state::AppDeps;

/// Universe-wide screen. Quotes arrive in one batch call; overviews fan out
/// per symbol; only the ranked shortlist pays for a sentiment lookup.
pub async fn build_goldman_screener(deps: &AppDeps, payload: &Value) -> Result<Value> {
    let profile = payload.get("investment_profile").cloned().unwrap_or(json!({}));
    let universe: Vec<String> = payload
        .get("universe")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str().map(|s| s.to_uppercase()))
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SCREEN_UNIVERSE.iter().map(|s| s.to_string()).collect());
    let limit = payload
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(10)
        .min(20) as usize;

    let overviews = join_all(universe.iter().map(|sym| deps.finviz.get_company_overview(sym))).await;
    let quotes_map = deps.market.quotes_batch(&universe).await;

    let mut picks = Vec::new();
    for (symbol, overview) in universe.iter().zip(overviews) {
        let Some(overview) = overview else { continue };
        let quote = quotes_map.get(&symbol.to_uppercase());
        let Some(price) = quote.and_then(|q| q.price) else { continue };
        let Some(pe) = safe_float(overview.get("pe")) else { continue };

        let debt = safe_float(overview.get("debt_eq"));
        let div_yield = safe_pct(overview.get("dividend_yield"));
        let sales_5y = safe_pct(overview.get("sales_past_5y"));
        let payout = safe_pct(overview.get("payout_ratio"));
        let moat = moat_rating(&overview);
        let (risk, risk_reason) = risk_score(&overview, quote);
        let sector = overview
            .get("sector")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown");

        let score = (if pe > 40.0 { 0.0 } else { (40.0 - pe) * 0.5 })
            + sales_5y.unwrap_or(0.0) * 150.0
            + match moat {
                "strong" => 10.0,
                "moderate" => 5.0,
                _ => 0.0,
            }
            + if div_yield.unwrap_or(0.0) > 0.01 && payout.unwrap_or(0.0) < 0.7 {
                5.0
            } else {
                0.0
            }
            - risk as f64 * 1.2;

        picks.push(json!({
            "symbol": symbol.to_uppercase(),
            "sector": sector,
            "price": price,
            "pe": pe,
            "sector_pe_comparison": if pe < 25.0 { "Below sector avg" } else { "Above sector avg" },
            "revenue_growth_5y": sales_5y,
            "debt_to_equity": debt,
            "dividend_yield": div_yield,
            "payout_ratio": payout,
            "moat": moat,
            "bull_target_12m": price * 1.2,
            "bear_target_12m": price * 0.85,
            "risk_rating": risk,
            "risk_reason": risk_reason,
            "entry_zone": [price * 0.96, price * 1.01],
            "stop_loss": price * 0.9,
            "score": (score * 100.0).round() / 100.0,
            "news_sentiment": "N/A",
        }));
    }

    picks.sort_by(|a, b| {
        b["score"]
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&a["score"].as_f64().unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    picks.truncate(limit);

    let sentiments = join_all(picks.iter().map(|p| {
        let symbol = p["symbol"].as_str().unwrap_or("").to_string();
        async move { deps.tavily.get_news_sentiment(&symbol).await }
    }))
    .await;
    for (pick, sentiment) in picks.iter_mut().zip(sentiments) {
        if let Some(s) = sentiment {
            pick["news_sentiment"] = json!(s.news_sentiment);
        }
    }

    let table_rows: Vec<Vec<String>> = picks
        .iter()
        .map(|p| {
            vec![
                p["symbol"].as_str().unwrap_or("").to_string(),
                p["sector"].as_str().unwrap_or("").to_string(),
                format!("${}", fmt_num(p["price"].as_f64(), 2)),
                fmt_num(p["pe"].as_f64(), 1),
                fmt_pct(p["revenue_growth_5y"].as_f64(), 1),
                fmt_num(p["debt_to_equity"].as_f64(), 2),
                fmt_pct(p["dividend_yield"].as_f64(), 1),
                p["moat"].as_str().unwrap_or("").to_string(),
                p["news_sentiment"].as_str().unwrap_or("N/A").to_string(),
                p["risk_rating"].to_string(),
                format!(
                    "${} / ${}",
                    fmt_num(p["bull_target_12m"].as_f64(), 2),
                    fmt_num(p["bear_target_12m"].as_f64(), 2)
                ),
            ]
        })
        .collect();

    let markdown = [
        "# Goldman Sachs Style Screening Report".to_string(),
        String::new(),
        format!("Generated: {}", now_iso()),
        format!("Profile snapshot: {profile}"),
        String::new(),
        markdown_table(
            &[
                "Ticker", "Sector", "Price", "P/E", "Rev 5Y", "D/E", "Div Yield", "Moat",
                "News Sent.", "Risk(1-10)", "Bull/Bear 12M",
            ],
            &table_rows,
        ),
    ]
    .join("\n");

    Ok(json!({
        "report_type": "goldman_screener",
        "title": "Goldman Sachs Stock Screener",
        "generated_at": now_iso(),
        "data": {"picks": picks},
        "markdown": markdown,
        "assumptions": [
            "Sector-average P/E comparison uses generic benchmark when sector-specific average unavailable.",
            "Price targets and entry zones are model-derived bands, not analyst consensus.",
        ],
        "limitations": [
            "Revenue growth and payout metrics depend on Finviz field availability per ticker.",
        ],
        "sources_used": default_sources("goldman_screener"),
    }))
}

/// Dividend-safety screen with income and DRIP projections.
pub async fn build_harvard_dividend(deps: &AppDeps, payload: &Value) -> Result<Value> {
    let amount = payload
        .get("investment_amount")
        .and_then(|v| v.as_f64())
        .filter(|a| *a > 0.0)
        .unwrap_or(100_000.0);
    let account_type = payload
        .get("account_type")
        .and_then(|v| v.as_str())
        .unwrap_or("taxable")
        .to_string();
    let universe: Vec<String> = payload
        .get("universe")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str().map(|s| s.to_uppercase()))
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_DIVIDEND_UNIVERSE.iter().map(|s| s.to_string()).collect());

    let overviews = join_all(universe.iter().map(|sym| deps.finviz.get_company_overview(sym))).await;

    let mut picks = Vec::new();
    for (symbol, overview) in universe.iter().zip(overviews) {
        let Some(overview) = overview else { continue };
        let dy = safe_pct(overview.get("dividend_yield")).unwrap_or(0.0);
        let payout = safe_pct(overview.get("payout_ratio")).unwrap_or(0.5);
        let debt = safe_float(overview.get("debt_eq")).unwrap_or(80.0);
        let beta = safe_float(overview.get("beta")).unwrap_or(1.0);
        let growth = safe_pct(overview.get("sales_past_5y")).unwrap_or(0.04);
        let safety = (9.0 - payout * 6.0 - debt / 120.0 - (beta - 1.0).max(0.0) * 2.0 + growth * 10.0)
            .round()
            .clamp(1.0, 10.0) as i64;
        picks.push(json!({
            "symbol": symbol,
            "yield": dy,
            "payout": payout,
            "debt_eq": debt,
            "dividend_growth_5y": growth,
            "safety_score": safety,
            "years_growth_proxy": ((growth * 100.0).max(1.0)) as i64,
        }));
    }

    picks.sort_by(|a, b| {
        let key_a = (a["safety_score"].as_i64().unwrap_or(0), a["yield"].as_f64().unwrap_or(0.0));
        let key_b = (b["safety_score"].as_i64().unwrap_or(0), b["yield"].as_f64().unwrap_or(0.0));
        key_b
            .partial_cmp(&key_a)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    picks.truncate(20);

    let yields: Vec<f64> = picks.iter().filter_map(|p| p["yield"].as_f64()).collect();
    let avg_yield = mean(&yields).unwrap_or(0.0);
    let monthly_income = amount * avg_yield / 12.0;
    let growths: Vec<f64> = picks
        .iter()
        .filter_map(|p| p["dividend_growth_5y"].as_f64())
        .collect();
    let div_growth = mean(&growths).unwrap_or(0.04).max(0.02);
    let drip_10y = amount * (1.0 + avg_yield + div_growth).powi(10);

    let table = markdown_table(
        &["Ticker", "Yield", "Safety (1-10)", "Payout", "Debt/Eq", "5Y Growth Proxy"],
        &picks
            .iter()
            .map(|p| {
                vec![
                    p["symbol"].as_str().unwrap_or("").to_string(),
                    fmt_pct(p["yield"].as_f64(), 1),
                    p["safety_score"].to_string(),
                    fmt_pct(p["payout"].as_f64(), 1),
                    fmt_num(p["debt_eq"].as_f64(), 1),
                    fmt_pct(p["dividend_growth_5y"].as_f64(), 1),
                ]
            })
            .collect::<Vec<_>>(),
    );

    let markdown = [
        "# Harvard Endowment Dividend Blueprint".to_string(),
        String::new(),
        table,
        String::new(),
        format!("Monthly income projection: **${}**", fmt_num(Some(monthly_income), 2)),
        format!("DRIP projection (10Y): **${}**", fmt_num(Some(drip_10y), 0)),
        format!(
            "Tax note ({account_type}): qualified dividends may receive favorable federal tax rates in taxable accounts."
        ),
    ]
    .join("\n");

    Ok(json!({
        "report_type": "harvard_dividend",
        "title": "Harvard Endowment Dividend Strategy",
        "generated_at": now_iso(),
        "data": {
            "picks": picks,
            "monthly_income_projection": monthly_income,
            "drip_projection_10y": drip_10y,
            "avg_yield": avg_yield,
            "dividend_growth_rate_estimate": div_growth,
        },
        "markdown": markdown,
        "assumptions": ["Dividend safety model uses payout, leverage, beta, and growth proxies."],
        "limitations": ["Dividend streak years may be approximate if explicit history is unavailable from source."],
        "sources_used": default_sources("harvard_dividend"),
    }))
}

/// Sector landscape: full stock contexts per competitor, loaded at most three
/// at a time to keep the scrape fan-out polite.
pub async fn build_bain_competitive(deps: &AppDeps, payload: &Value) -> Result<Value> {
    let sector = payload
        .get("sector")
        .and_then(|v| v.as_str())
        .unwrap_or("big tech")
        .to_lowercase();
    let symbols: Vec<String> = payload
        .get("symbols")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str().map(|s| s.to_uppercase()))
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| sector_competitors(&sector).iter().map(|s| s.to_string()).collect());
    let symbols: Vec<String> = symbols.into_iter().take(7).collect();

    let semaphore = Arc::new(Semaphore::new(3));
    let contexts = join_all(symbols.iter().map(|sym| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore open");
            load_stock_context(deps, sym, false).await
        }
    }))
    .await;

    let mut comps = Vec::new();
    for ctx in &contexts {
        let ov = &ctx.overview;
        let returns = daily_returns(&ctx.history);
        let one_year = if returns.len() >= 252 {
            returns[returns.len() - 252..].iter().sum::<f64>()
        } else {
            returns.iter().sum::<f64>()
        };
        let roe = safe_pct(ov.get("roe")).unwrap_or(0.0);
        let margin = safe_pct(ov.get("profit_margin")).unwrap_or(0.0);
        let r_and_d_proxy = safe_pct(ov.get("sales_past_5y")).unwrap_or(0.0);
        let moat_score = roe * 100.0 + margin * 80.0 + r_and_d_proxy * 40.0;
        comps.push(json!({
            "symbol": ctx.symbol,
            "market_cap": safe_float(ov.get("market_cap")).unwrap_or(0.0),
            "revenue": safe_float(ov.get("revenue")).unwrap_or(0.0),
            "profit_margin": margin,
            "roe": roe,
            "one_year_price_change_proxy": one_year,
            "moat_rating": if moat_score > 35.0 { "strong" } else if moat_score > 20.0 { "moderate" } else { "weak" },
            "management_quality": ((2.0 + roe * 30.0 + margin * 20.0).clamp(1.0, 10.0)).round() as i64,
            "innovation_proxy": r_and_d_proxy,
            "price": ctx.quote.as_ref().and_then(|q| q.price),
        }));
    }

    comps.sort_by(|a, b| {
        let key = |c: &Value| {
            (
                c["moat_rating"] == "strong",
                c["management_quality"].as_i64().unwrap_or(0),
                (c["profit_margin"].as_f64().unwrap_or(0.0) * 1e6) as i64,
            )
        };
        key(b).cmp(&key(a))
    });

    let winner = comps.first().cloned();
    let winner_context = winner.as_ref().and_then(|w| {
        contexts
            .iter()
            .find(|ctx| Some(ctx.symbol.as_str()) == w["symbol"].as_str())
    });

    let swot: Vec<Value> = comps
        .iter()
        .take(2)
        .map(|comp| {
            json!({
                "symbol": comp["symbol"],
                "strengths": ["Scale advantages", "Margin profile", "Capital allocation discipline"],
                "weaknesses": ["Valuation sensitivity"],
                "opportunities": ["AI/new product cycle", "International expansion"],
                "threats": ["Regulatory pressure", "Disruption risk"],
            })
        })
        .collect();

    let table = markdown_table(
        &["Ticker", "Market Cap", "Revenue", "Profit Margin", "Moat", "Mgmt Quality"],
        &comps
            .iter()
            .map(|c| {
                vec![
                    c["symbol"].as_str().unwrap_or("").to_string(),
                    fmt_num(c["market_cap"].as_f64(), 0),
                    fmt_num(c["revenue"].as_f64(), 0),
                    fmt_pct(c["profit_margin"].as_f64(), 1),
                    c["moat_rating"].as_str().unwrap_or("").to_string(),
                    c["management_quality"].to_string(),
                ]
            })
            .collect::<Vec<_>>(),
    );

    let winner_line = winner
        .as_ref()
        .map(|w| format!("Best pick: **{}**", w["symbol"].as_str().unwrap_or("")))
        .unwrap_or_else(|| "No winner.".to_string());
    let catalyst_rows: Vec<Vec<String>> = winner_context
        .map(|ctx| {
            ctx.headlines
                .iter()
                .take(4)
                .map(|h| {
                    vec![
                        h["title"].as_str().unwrap_or("N/A").to_string(),
                        h["source"].as_str().unwrap_or("N/A").to_string(),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();
    let catalyst_table = if catalyst_rows.is_empty() {
        markdown_table(&["Headline", "Source"], &[vec!["N/A".into(), "N/A".into()]])
    } else {
        markdown_table(&["Headline", "Source"], &catalyst_rows)
    };

    let title_sector = {
        let mut chars = sector.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => sector.clone(),
        }
    };
    let markdown = [
        format!("# Bain Competitive Landscape: {title_sector}"),
        String::new(),
        table,
        String::new(),
        winner_line,
        String::new(),
        "## Winner Catalysts (Web)".into(),
        catalyst_table,
    ]
    .join("\n");

    Ok(json!({
        "report_type": "bain_competitive",
        "title": "Bain Competitive Analysis",
        "generated_at": now_iso(),
        "data": {
            "sector": sector,
            "companies": comps,
            "best_pick": winner,
            "swot_top2": swot,
            "sector_threats": ["Regulatory risk", "Rate sensitivity", "Supply-chain volatility"],
            "subagent_trace": winner_context.map(|c| c.subagent_trace.clone()).unwrap_or_default(),
        },
        "markdown": markdown,
        "assumptions": ["Market share trend is proxied by relative price-performance and scale metrics."],
        "limitations": ["Direct market-share datasets are not integrated in this version."],
        "sources_used": default_sources("bain_competitive"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_defaults_apply() {
        assert_eq!(sector_competitors("semiconductors").len(), 6);
        assert!(sector_competitors("big tech").contains(&"AAPL"));
    }
}
