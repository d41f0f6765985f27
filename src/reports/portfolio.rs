//! Portfolio-level builders: risk assessment, allocation builder, and the
//! macro impact briefing.

use anyhow::{bail, Result};
use futures_util::future::join_all;
use nalgebra::DMatrix;
use serde_json::{json, Value};

use crate::models::now_iso;
use crate::reports::helpers::*;
use crate::state::AppDeps;

/// Normalize the payload's holdings to weights summing to 1. Equal-weights
/// when no usable weights are provided.
pub fn resolve_portfolio_input(payload: &Value) -> Vec<(String, f64)> {
    let Some(holdings) = payload.get("holdings").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut normalized: Vec<(String, f64)> = Vec::new();
    let mut total = 0.0;
    for h in holdings {
        let symbol = h
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_uppercase();
        if symbol.is_empty() {
            continue;
        }
        let weight = h.get("weight").and_then(|v| v.as_f64()).unwrap_or(0.0).max(0.0);
        total += weight;
        normalized.push((symbol, weight));
    }
    if total > 0.0 {
        for (_, w) in &mut normalized {
            *w /= total;
        }
    } else if !normalized.is_empty() {
        let equal = 1.0 / normalized.len() as f64;
        for (_, w) in &mut normalized {
            *w = equal;
        }
    }
    normalized
}

/// Correlation matrix, concentration heatmap, and a stress-drawdown estimate.
pub async fn build_bridgewater_risk(deps: &AppDeps, payload: &Value) -> Result<Value> {
    let positions = resolve_portfolio_input(payload);
    if positions.is_empty() {
        bail!("Portfolio holdings are required for risk assessment.");
    }
    let symbols: Vec<String> = positions.iter().map(|(s, _)| s.clone()).collect();

    let histories = join_all(symbols.iter().map(|sym| deps.market.history(sym, 260))).await;
    let returns_map: Vec<Vec<f64>> = histories.iter().map(|h| daily_returns(h)).collect();

    // Pairwise Pearson correlations as a dense matrix.
    let n = symbols.len();
    let mut corr = DMatrix::<f64>::identity(n, n);
    for i in 0..n {
        for j in (i + 1)..n {
            let c = correlation(&returns_map[i], &returns_map[j]).unwrap_or(0.0);
            corr[(i, j)] = c;
            corr[(j, i)] = c;
        }
    }
    let corr_rows: Vec<Value> = symbols
        .iter()
        .enumerate()
        .map(|(i, sym)| {
            let mut row = serde_json::Map::new();
            row.insert("symbol".to_string(), json!(sym));
            for (j, other) in symbols.iter().enumerate() {
                row.insert(other.clone(), json!((corr[(i, j)] * 1000.0).round() / 1000.0));
            }
            Value::Object(row)
        })
        .collect();

    let overviews = join_all(symbols.iter().map(|sym| deps.finviz.get_company_overview(sym))).await;
    let mut sector_exposure: Vec<(String, f64)> = Vec::new();
    let mut geo_exposure: Vec<(String, f64)> = Vec::new();
    for ((_, weight), overview) in positions.iter().zip(&overviews) {
        let ov = overview.clone().unwrap_or(json!({}));
        let sector = ov
            .get("sector")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown")
            .to_string();
        let country = ov
            .get("country")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("US")
            .to_string();
        match sector_exposure.iter_mut().find(|(s, _)| *s == sector) {
            Some((_, w)) => *w += weight,
            None => sector_exposure.push((sector, *weight)),
        }
        match geo_exposure.iter_mut().find(|(g, _)| *g == country) {
            Some((_, w)) => *w += weight,
            None => geo_exposure.push((country, *weight)),
        }
    }
    sector_exposure.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let concentration_risk = sector_exposure.first().map(|(_, w)| *w).unwrap_or(0.0);

    let mean_abs_drift: f64 = returns_map
        .iter()
        .filter_map(|r| mean(r))
        .map(|m| m.abs())
        .sum();
    let recession_drawdown = -(0.12 + concentration_risk * 0.18 + mean_abs_drift * 5.0);

    let max_offdiag = (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .map(|(i, j)| corr[(i, j)].abs())
        .fold(0.0f64, f64::max);
    let max_weight = positions.iter().map(|(_, w)| *w).fold(0.0f64, f64::max);
    let top_risks = json!([
        {"risk": "Sector concentration", "severity": (concentration_risk * 1000.0).round() / 10.0},
        {"risk": "Correlation clustering", "severity": (max_offdiag * 1000.0).round() / 10.0},
        {"risk": "Liquidity + single-name", "severity": (max_weight * 1000.0).round() / 10.0},
    ]);

    let heatmap = markdown_table(
        &["Sector", "Weight"],
        &sector_exposure
            .iter()
            .map(|(sector, weight)| vec![sector.clone(), fmt_pct(Some(*weight), 1)])
            .collect::<Vec<_>>(),
    );
    let markdown = [
        "# Bridgewater Portfolio Risk Report".to_string(),
        String::new(),
        format!(
            "Estimated recession stress drawdown: **{:.1}%**",
            recession_drawdown * 100.0
        ),
        String::new(),
        "## Sector Heatmap Summary".into(),
        heatmap,
    ]
    .join("\n");

    Ok(json!({
        "report_type": "bridgewater_risk",
        "title": "Bridgewater Risk Assessment",
        "generated_at": now_iso(),
        "data": {
            "positions": positions.iter().map(|(s, w)| json!({"symbol": s, "weight": w})).collect::<Vec<_>>(),
            "sector_exposure": sector_exposure.iter().cloned().collect::<std::collections::HashMap<_, _>>(),
            "geo_exposure": geo_exposure.iter().cloned().collect::<std::collections::HashMap<_, _>>(),
            "correlation_matrix": corr_rows,
            "estimated_recession_drawdown": recession_drawdown,
            "top_risks": top_risks,
            "hedging_strategies": [
                "Add index put spread protection on the largest equity sleeve.",
                "Reduce top sector exposure and rotate 10-15% into short-duration Treasuries.",
                "Cap single-stock allocations at 8% and rebalance monthly.",
            ],
        },
        "markdown": markdown,
        "assumptions": ["Risk model is based on trailing returns and static weights."],
        "limitations": ["No intraday liquidity/volume shock model is included."],
        "sources_used": default_sources("bridgewater_risk"),
    }))
}

/// Risk-tolerance-driven allocation with ETF sleeves and projections.
pub async fn build_blackrock_builder(_deps: &AppDeps, payload: &Value) -> Result<Value> {
    let details = payload.get("details").unwrap_or(payload);
    let risk = details
        .get("risk_tolerance")
        .and_then(|v| v.as_str())
        .unwrap_or("moderate")
        .to_lowercase();
    let account_type = details
        .get("account_type")
        .and_then(|v| v.as_str())
        .unwrap_or("taxable")
        .to_lowercase();
    let monthly = details
        .get("monthly_investment")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    let (stocks, bonds, alternatives) = match risk.as_str() {
        "aggressive" | "high" => (0.80, 0.15, 0.05),
        "conservative" | "low" => (0.45, 0.50, 0.05),
        _ => (0.65, 0.30, 0.05),
    };
    let etfs = json!({
        "stocks_core": ["VTI", "VOO", "QQQM"],
        "stocks_satellite": ["SMH", "VIG", "XLF"],
        "bonds_core": ["BND", "AGG", "SCHP"],
        "alternatives": ["GLD", "VNQ"],
    });
    let exp_return = stocks * 0.09 + bonds * 0.04 + alternatives * 0.05;
    let max_drawdown = -(stocks * 0.42 + bonds * 0.08 + alternatives * 0.15);

    let table = markdown_table(
        &["Asset Class", "Allocation", "Suggested ETFs/Funds"],
        &[
            vec![
                "Stocks (Core+Satellite)".into(),
                fmt_pct(Some(stocks), 0),
                "VTI, VOO, QQQM, SMH".into(),
            ],
            vec!["Bonds".into(), fmt_pct(Some(bonds), 0), "BND, AGG".into()],
            vec!["Alternatives".into(), fmt_pct(Some(alternatives), 0), "GLD, VNQ".into()],
        ],
    );
    let markdown = [
        "# BlackRock Portfolio Builder".to_string(),
        String::new(),
        table,
        String::new(),
        format!(
            "Expected annual return range: **{:.1}% - {:.1}%**",
            (exp_return - 0.02) * 100.0,
            (exp_return + 0.02) * 100.0
        ),
        format!("Expected bad-year drawdown: **{:.1}%**", max_drawdown * 100.0),
        "Rebalancing: quarterly check, trade only if sleeve drift exceeds +/-5%.".into(),
        format!(
            "Tax efficiency note ({account_type}): prioritize low-turnover broad-market ETFs in taxable accounts."
        ),
        format!("DCA plan: invest ${} /month proportionally to target weights.", fmt_num(Some(monthly), 0)),
        "Benchmark: 70/30 blend of S&P 500 and US Aggregate Bond Index.".into(),
    ]
    .join("\n");

    Ok(json!({
        "report_type": "blackrock_builder",
        "title": "BlackRock Portfolio Builder",
        "generated_at": now_iso(),
        "data": {
            "allocation": {"stocks": stocks, "bonds": bonds, "alternatives": alternatives},
            "etf_recommendations": etfs,
            "expected_return": exp_return,
            "expected_max_drawdown": max_drawdown,
            "benchmark": "70% S&P 500 / 30% Bloomberg US Agg",
        },
        "markdown": markdown,
        "assumptions": ["Expected returns are long-horizon historical proxies."],
        "limitations": ["Does not include personal tax-lot constraints or employer plan fund menus."],
        "sources_used": default_sources("blackrock_builder"),
    }))
}

/// Macro snapshot read into a cycle assessment and portfolio adjustments.
pub async fn build_mckinsey_macro(deps: &AppDeps, payload: &Value) -> Result<Value> {
    let holdings = resolve_portfolio_input(payload);
    let macro_ind = deps.fred.get_key_indicators().await;

    let value_of = |key: &str| macro_ind.get(key).and_then(|i| i.value);
    let fed = value_of("fed_funds");
    let cpi = value_of("cpi");
    let unemp = value_of("unemployment");
    let ten_y = value_of("10y_treasury");

    let cycle = match fed {
        Some(f) if f < 2.0 => "early-cycle",
        Some(f) if f > 4.5 => "slowdown / restrictive",
        _ => "late-cycle",
    };

    let mut adjustments = vec![
        "Trim high-duration growth exposure by 5-10% if rates stay restrictive.".to_string(),
        "Add quality value + healthcare defensives for inflation-resilient cash flows.".to_string(),
        "Hold a short-duration bond sleeve for optionality around policy pivots.".to_string(),
    ];
    if !holdings.is_empty() {
        let mut top = holdings.clone();
        top.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let top_txt = top
            .iter()
            .take(3)
            .map(|(s, w)| format!("{s} ({:.1}%)", w * 100.0))
            .collect::<Vec<_>>()
            .join(", ");
        adjustments.push(format!("Top holdings concentration: {top_txt}."));
    }

    let fmt_opt = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_else(|| "None".to_string());
    let table = markdown_table(
        &["Indicator", "Latest"],
        &[
            vec!["Fed Funds".into(), fmt_opt(fed)],
            vec!["CPI".into(), fmt_opt(cpi)],
            vec!["Unemployment".into(), fmt_opt(unemp)],
            vec!["10Y Treasury".into(), fmt_opt(ten_y)],
            vec!["Cycle Assessment".into(), cycle.to_string()],
        ],
    );
    let markdown = [
        "# McKinsey Macro Strategy Briefing".to_string(),
        String::new(),
        table,
        String::new(),
        "## Action Plan".into(),
        adjustments
            .iter()
            .map(|a| format!("- {a}"))
            .collect::<Vec<_>>()
            .join("\n"),
    ]
    .join("\n");

    Ok(json!({
        "report_type": "mckinsey_macro",
        "title": "McKinsey Macro Economic Impact Report",
        "generated_at": now_iso(),
        "data": {
            "macro_snapshot": serde_json::to_value(&macro_ind)?,
            "cycle_assessment": cycle,
            "recommended_adjustments": adjustments,
            "timeline": "Most macro transmission effects expected over the next 3-12 months.",
        },
        "markdown": markdown,
        "assumptions": ["Macro effects are interpreted through standard growth/value and duration sensitivity frameworks."],
        "limitations": ["This briefing does not include real-time central bank event transcript parsing."],
        "sources_used": default_sources("mckinsey_macro"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holdings_normalize_to_unit_weights() {
        let payload = json!({"holdings": [
            {"symbol": "aapl", "weight": 2.0},
            {"symbol": "MSFT", "weight": 2.0},
        ]});
        let positions = resolve_portfolio_input(&payload);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].0, "AAPL");
        assert!((positions[0].1 - 0.5).abs() < 1e-12);
        let total: f64 = positions.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_weights_become_equal_weights() {
        let payload = json!({"holdings": [
            {"symbol": "AAPL"},
            {"symbol": "MSFT"},
            {"symbol": "NVDA"},
        ]});
        let positions = resolve_portfolio_input(&payload);
        for (_, w) in &positions {
            assert!((w - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_or_missing_holdings() {
        assert!(resolve_portfolio_input(&json!({})).is_empty());
        assert!(resolve_portfolio_input(&json!({"holdings": []})).is_empty());
        assert!(resolve_portfolio_input(&json!({"holdings": [{"weight": 1.0}]})).is_empty());
    }

    #[tokio::test]
    async fn risk_report_requires_holdings() {
        let deps = crate::state::AppDeps::for_tests();
        let err = build_bridgewater_risk(&deps, &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("holdings are required"));
    }

    #[tokio::test]
    async fn allocation_by_risk_tolerance() {
        let deps = crate::state::AppDeps::for_tests();
        let aggressive = build_blackrock_builder(&deps, &json!({"risk_tolerance": "aggressive"}))
            .await
            .unwrap();
        assert_eq!(aggressive["data"]["allocation"]["stocks"], 0.80);
        let conservative = build_blackrock_builder(
            &deps,
            &json!({"details": {"risk_tolerance": "conservative", "monthly_investment": 500}}),
        )
        .await
        .unwrap();
        assert_eq!(conservative["data"]["allocation"]["bonds"], 0.50);
        assert!(conservative["markdown"]
            .as_str()
            .unwrap()
            .contains("BlackRock Portfolio Builder"));
    }
}
