//! Technical builders: the report card and the seasonality pattern memo.

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{Datelike, NaiveDate};
use serde_json::{json, Value};

use crate::models::now_iso;
use crate::reports::helpers::*;
use crate::state::AppDeps;
use crate::ta;

/// Trend/momentum report card with Fibonacci retracements and an
/// entry/stop/target plan.
pub async fn build_citadel_technical(deps: &AppDeps, payload: &Value) -> Result<Value> {
    let Some(ticker) = extract_ticker(payload) else {
        bail!("Ticker is required for technical analysis.");
    };

    let history = deps.market.history(&ticker, 420).await;
    if history.is_empty() {
        bail!("No price history available for {ticker}.");
    }
    let closes = ta::extract_closes(&history);
    let snapshot = ta::analyze(&ticker, &closes).ok();

    let current = *closes.last().expect("non-empty history");
    let window = &closes[closes.len().saturating_sub(120)..];
    let high = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let low = window.iter().cloned().fold(f64::INFINITY, f64::min);
    let diff = high - low;
    let fib_levels = json!({
        "23.6%": high - diff * 0.236,
        "38.2%": high - diff * 0.382,
        "50.0%": high - diff * 0.5,
        "61.8%": high - diff * 0.618,
    });

    let tail = &closes[closes.len().saturating_sub(20)..];
    let support = snapshot
        .as_ref()
        .map(|s| s.support)
        .unwrap_or_else(|| tail.iter().cloned().fold(f64::INFINITY, f64::min));
    let resistance = snapshot
        .as_ref()
        .map(|s| s.resistance)
        .unwrap_or_else(|| tail.iter().cloned().fold(f64::NEG_INFINITY, f64::max));
    let stop = support * 0.98;
    let target = resistance * 1.05;
    let rr = (target - current) / (current - stop).max(0.0001);

    let trend = snapshot.as_ref().map(|s| s.trend.to_lowercase());
    let rsi = snapshot.as_ref().map(|s| s.rsi_14);
    let confidence = match (&trend, rsi) {
        (Some(t), Some(r)) if t == "bullish" && r < 70.0 && rr >= 1.5 => "buy",
        (Some(t), Some(r)) if t == "bearish" && r > 30.0 => "sell",
        _ => "neutral",
    };

    let metric_rows = vec![
        vec!["Trend".to_string(), trend.clone().unwrap_or_else(|| "N/A".into())],
        vec![
            "RSI(14)".to_string(),
            rsi.map(|r| format!("{r:.1}")).unwrap_or_else(|| "N/A".into()),
        ],
        vec![
            "MACD".to_string(),
            snapshot
                .as_ref()
                .map(|s| format!("{:.4}", s.macd))
                .unwrap_or_else(|| "N/A".into()),
        ],
        vec![
            "SMA 50 / SMA 200".to_string(),
            snapshot
                .as_ref()
                .map(|s| format!("{:.2} / {:.2}", s.sma_50, s.sma_200))
                .unwrap_or_else(|| "N/A".into()),
        ],
        vec![
            "Support / Resistance".to_string(),
            format!("${} / ${}", fmt_num(Some(support), 2), fmt_num(Some(resistance), 2)),
        ],
        vec![
            "Entry / Stop / Target".to_string(),
            format!(
                "${} / ${} / ${}",
                fmt_num(Some(current), 2),
                fmt_num(Some(stop), 2),
                fmt_num(Some(target), 2)
            ),
        ],
        vec!["Risk:Reward".to_string(), format!("{rr:.2}x")],
        vec!["Confidence".to_string(), confidence.to_uppercase()],
    ];

    let fib_rows: Vec<Vec<String>> = fib_levels
        .as_object()
        .expect("fib object")
        .iter()
        .map(|(level, price)| vec![level.clone(), format!("${}", fmt_num(price.as_f64(), 2))])
        .collect();

    let markdown = [
        format!("# Citadel Technical Report Card: {ticker}"),
        String::new(),
        markdown_table(&["Metric", "Reading"], &metric_rows),
        String::new(),
        "Fibonacci retracement levels:".into(),
        markdown_table(&["Level", "Price"], &fib_rows),
    ]
    .join("\n");

    Ok(json!({
        "report_type": "citadel_technical",
        "title": "Citadel Technical Analysis",
        "generated_at": now_iso(),
        "data": {
            "ticker": ticker,
            "trend": trend,
            "support": support,
            "resistance": resistance,
            "entry": current,
            "stop_loss": stop,
            "target": target,
            "risk_reward": rr,
            "fib_levels": fib_levels,
            "confidence": confidence,
            "indicators": snapshot,
        },
        "markdown": markdown,
        "assumptions": ["Multi-timeframe trend is inferred from daily data history and moving averages."],
        "limitations": ["Pattern recognition is rule-based and does not include image-based chart model inference."],
        "sources_used": default_sources("citadel_technical"),
    }))
}

/// Average daily return by calendar month (1-12) and weekday (0=Mon..4=Fri).
pub fn seasonality_maps(
    history: &[crate::models::HistoryRow],
) -> (HashMap<u32, f64>, HashMap<u32, f64>) {
    let returns = daily_returns(history);
    let mut monthly: HashMap<u32, Vec<f64>> = HashMap::new();
    let mut weekday: HashMap<u32, Vec<f64>> = HashMap::new();
    for (i, row) in history.iter().enumerate().skip(1) {
        let Ok(date) = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d") else {
            continue;
        };
        let r = returns.get(i - 1).copied().unwrap_or(0.0);
        monthly.entry(date.month()).or_default().push(r);
        let dow = date.weekday().num_days_from_monday();
        if dow < 5 {
            weekday.entry(dow).or_default().push(r);
        }
    }
    let avg = |m: HashMap<u32, Vec<f64>>| {
        m.into_iter()
            .map(|(k, v)| (k, mean(&v).unwrap_or(0.0)))
            .collect::<HashMap<u32, f64>>()
    };
    (avg(monthly), avg(weekday))
}

fn extreme_key(map: &HashMap<u32, f64>, best: bool) -> u32 {
    let mut entries: Vec<(&u32, &f64)> = map.iter().collect();
    entries.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));
    if best {
        entries.last().map(|(k, _)| **k).unwrap_or(1)
    } else {
        entries.first().map(|(k, _)| **k).unwrap_or(1)
    }
}

/// Multi-year seasonality plus short-interest and insider context.
pub async fn build_renaissance_pattern(deps: &AppDeps, payload: &Value) -> Result<Value> {
    let Some(ticker) = extract_ticker(payload) else {
        bail!("Ticker is required for pattern analysis.");
    };
    let years = payload.get("years").and_then(|v| v.as_u64()).unwrap_or(5) as u32;
    let days = (years * 252).clamp(252, 2520);

    let (history_long, movers, ctx) = tokio::join!(
        deps.market.history(&ticker, days),
        deps.market.movers(),
        load_stock_context(deps, &ticker, false),
    );

    let mut history = history_long;
    if history.is_empty() {
        history = ctx.history.clone();
    }
    if history.is_empty() {
        history = deps.market.history(&ticker, 365).await;
    }
    if history.is_empty() {
        bail!("No history found for {ticker}. Analysis requires at least 1 year of price data.");
    }

    let (monthly_avg, dow_avg) = seasonality_maps(&history);
    let best_month = extreme_key(&monthly_avg, true);
    let worst_month = extreme_key(&monthly_avg, false);
    let best_day = extreme_key(&dow_avg, true);
    let worst_day = extreme_key(&dow_avg, false);

    let short_float = safe_pct(ctx.overview.get("short_float"));
    let insider_count = ctx
        .insiders
        .get("insider_trades")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0);

    let pattern_table = markdown_table(
        &["Pattern", "Finding"],
        &[
            vec!["Best month".into(), best_month.to_string()],
            vec!["Worst month".into(), worst_month.to_string()],
            vec!["Best weekday (0=Mon)".into(), best_day.to_string()],
            vec!["Worst weekday (0=Mon)".into(), worst_day.to_string()],
            vec!["Short float".into(), fmt_pct(short_float, 1)],
            vec!["Recent insider records".into(), insider_count.to_string()],
        ],
    );
    let event_rows: Vec<Vec<String>> = ctx
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
    let event_table = if event_rows.is_empty() {
        markdown_table(&["Headline", "Source"], &[vec!["N/A".into(), "N/A".into()]])
    } else {
        markdown_table(&["Headline", "Source"], &event_rows)
    };

    let markdown = [
        format!("# Renaissance Pattern Memo: {ticker}"),
        String::new(),
        pattern_table,
        String::new(),
        "## Recent Event Signals".into(),
        event_table,
    ]
    .join("\n");

    Ok(json!({
        "report_type": "renaissance_pattern",
        "title": "Renaissance Pattern Finder",
        "generated_at": now_iso(),
        "data": {
            "ticker": ticker,
            "best_month": best_month,
            "worst_month": worst_month,
            "best_weekday": best_day,
            "worst_weekday": worst_day,
            "monthly_averages": monthly_avg.iter().map(|(k, v)| (k.to_string(), *v)).collect::<HashMap<_, _>>(),
            "weekday_averages": dow_avg.iter().map(|(k, v)| (k.to_string(), *v)).collect::<HashMap<_, _>>(),
            "insider_activity": ctx.insiders,
            "short_interest_proxy": short_float,
            "sector_rotation_signal": movers,
            "edge_summary": format!("Seasonality favors month {best_month} and weekday {best_day}."),
            "subagent_trace": ctx.subagent_trace,
        },
        "markdown": markdown,
        "assumptions": ["Patterns are based on historical daily return seasonality."],
        "limitations": ["Event correlations (Fed/CPI/options flow) use proxy signals without dedicated event database."],
        "sources_used": default_sources("renaissance_pattern"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HistoryRow;

    fn row(date: &str, close: f64) -> HistoryRow {
        HistoryRow {
            symbol: "X".into(),
            date: date.into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1,
        }
    }

    #[test]
    fn seasonality_attributes_returns_to_calendar_buckets() {
        // Jan 2 (Tue) 100 -> Jan 3 (Wed) +10% -> Feb 1 (Thu) -10%
        let history = vec![
            row("2024-01-02", 100.0),
            row("2024-01-03", 110.0),
            row("2024-02-01", 99.0),
        ];
        let (monthly, weekday) = seasonality_maps(&history);
        assert!((monthly[&1] - 0.1).abs() < 1e-9);
        assert!((monthly[&2] + 0.1).abs() < 1e-9);
        // Jan 3 2024 was a Wednesday (index 2), Feb 1 a Thursday (index 3).
        assert!((weekday[&2] - 0.1).abs() < 1e-9);
        assert!((weekday[&3] + 0.1).abs() < 1e-9);
    }

    #[test]
    fn extreme_keys_pick_best_and_worst() {
        let mut map = HashMap::new();
        map.insert(1u32, -0.01);
        map.insert(5u32, 0.02);
        map.insert(9u32, 0.005);
        assert_eq!(extreme_key(&map, true), 5);
        assert_eq!(extreme_key(&map, false), 1);
        assert_eq!(extreme_key(&HashMap::new(), true), 1);
    }

    #[tokio::test]
    async fn citadel_requires_ticker() {
        let deps = crate::state::AppDeps::for_tests();
        let err = build_citadel_technical(&deps, &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Ticker is required"));
    }
}
