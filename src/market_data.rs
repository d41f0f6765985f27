//! Unified market data provider with Schwab-first fallback.
//!
//! Hides provider heterogeneity behind one API: quotes, history, movers,
//! hours, news, profiles. History goes through a staleness check so a
//! provider returning old candles is treated as having returned nothing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde_json::Value;

use crate::config::SETTINGS;
use crate::models::{HistoryRow, Quote};
use crate::providers::alpaca::AlpacaClient;
use crate::providers::finviz::FinvizClient;
use crate::providers::schwab::SchwabClient;

pub const HISTORY_MAX_AGE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Schwab,
    Alpaca,
}

pub fn provider_order() -> [Provider; 2] {
    match SETTINGS.market_data_provider.as_str() {
        "alpaca" => [Provider::Alpaca, Provider::Schwab],
        _ => [Provider::Schwab, Provider::Alpaca],
    }
}

/// Schwab daily candles require month/year periods; `day` is intraday only.
pub fn map_days_to_period(days: u32) -> (&'static str, u32) {
    match days {
        0..=30 => ("month", 1),
        31..=60 => ("month", 2),
        61..=90 => ("month", 3),
        91..=180 => ("month", 6),
        181..=365 => ("year", 1),
        366..=730 => ("year", 2),
        731..=1825 => ("year", 5),
        _ => ("year", 10),
    }
}

/// Map a raw candle payload (`{"candles": [...]}`) onto normalized rows.
/// Timestamps arrive as ms epochs or ISO strings depending on provider.
pub fn normalize_history(raw: &Value, symbol: &str, days: usize) -> Vec<HistoryRow> {
    let Some(candles) = raw.get("candles").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let start = candles.len().saturating_sub(days);
    candles[start..]
        .iter()
        .filter_map(|c| {
            let date = match c.get("datetime") {
                Some(Value::Number(n)) => {
                    let ms = n.as_i64()?;
                    chrono::TimeZone::timestamp_millis_opt(&Utc, ms)
                        .single()?
                        .format("%Y-%m-%d")
                        .to_string()
                }
                Some(Value::String(s)) => s.chars().take(10).collect(),
                _ => return None,
            };
            Some(HistoryRow {
                symbol: symbol.to_uppercase(),
                date,
                open: c.get("open")?.as_f64()?,
                high: c.get("high")?.as_f64()?,
                low: c.get("low")?.as_f64()?,
                close: c.get("close")?.as_f64()?,
                volume: c.get("volume").and_then(|v| v.as_i64()).unwrap_or(0),
            })
        })
        .collect()
}

/// A series is stale when its most recent candle is older than the freshness
/// window. Exactly `max_age_days` old is still fresh.
pub fn is_history_stale(rows: &[HistoryRow], max_age_days: i64) -> bool {
    let Some(last) = rows.last() else {
        return true;
    };
    let date_text: String = last.date.chars().take(10).collect();
    let Ok(date) = NaiveDate::parse_from_str(&date_text, "%Y-%m-%d") else {
        return true;
    };
    let today = Utc::now().date_naive();
    (today - date).num_days() > max_age_days
}

pub struct MarketData {
    schwab: Arc<SchwabClient>,
    alpaca: Arc<AlpacaClient>,
    finviz: Arc<FinvizClient>,
}

impl MarketData {
    pub fn new(schwab: Arc<SchwabClient>, alpaca: Arc<AlpacaClient>, finviz: Arc<FinvizClient>) -> Self {
        Self { schwab, alpaca, finviz }
    }

    pub async fn quote(&self, symbol: &str) -> Option<Quote> {
        for provider in provider_order() {
            let quote = match provider {
                Provider::Schwab => self.schwab.get_quote(symbol).await,
                Provider::Alpaca => self.alpaca.get_quote(symbol).await,
            };
            if let Some(q) = quote {
                if q.price.is_some() {
                    return Some(q);
                }
            }
        }
        None
    }

    /// Batch quotes. Schwab answers a multi-symbol request in one call;
    /// otherwise symbols are resolved one by one through the fallback chain.
    pub async fn quotes_batch(&self, symbols: &[String]) -> HashMap<String, Quote> {
        if provider_order().contains(&Provider::Schwab) {
            let quotes = self.schwab.get_multiple_quotes(symbols).await;
            if !quotes.is_empty() {
                return quotes
                    .into_iter()
                    .filter(|(_, q)| q.price.is_some())
                    .collect();
            }
        }
        let mut out = HashMap::new();
        for symbol in symbols {
            if let Some(q) = self.quote(symbol).await {
                out.insert(symbol.to_uppercase(), q);
            }
        }
        out
    }

    pub async fn history(&self, symbol: &str, days: u32) -> Vec<HistoryRow> {
        for provider in provider_order() {
            match provider {
                Provider::Schwab => {
                    let (period_type, period) = map_days_to_period(days);
                    if let Some(raw) = self
                        .schwab
                        .get_price_history(symbol, period_type, period, "daily", 1)
                        .await
                    {
                        let rows = normalize_history(&raw, symbol, days as usize);
                        if !rows.is_empty() && !is_history_stale(&rows, HISTORY_MAX_AGE_DAYS) {
                            return rows;
                        }
                    }
                }
                Provider::Alpaca => {
                    if let Some(raw) = self.alpaca.get_history(symbol, days.max(30) as usize).await {
                        let start = raw.len().saturating_sub(days as usize);
                        let rows = raw[start..].to_vec();
                        if !rows.is_empty() && !is_history_stale(&rows, HISTORY_MAX_AGE_DAYS) {
                            return rows;
                        }
                    }
                }
            }
        }
        Vec::new()
    }

    pub async fn movers(&self) -> Option<Value> {
        for provider in provider_order() {
            match provider {
                Provider::Schwab => {
                    if let Some(report) = self.schwab.get_market_movers("$SPX", "PERCENT_CHANGE_UP").await {
                        return serde_json::to_value(&report).ok();
                    }
                }
                Provider::Alpaca => {
                    if let Some(movers) = self.alpaca.get_movers(10).await {
                        return Some(movers);
                    }
                }
            }
        }
        None
    }

    pub async fn market_hours(&self, markets: &[String]) -> Option<Value> {
        self.schwab.get_market_hours(markets).await
    }

    pub async fn stock_news(&self, symbol: Option<&str>, limit: usize) -> Vec<crate::models::NewsArticle> {
        self.alpaca.get_news(symbol, limit).await.unwrap_or_default()
    }

    pub async fn company_profile(&self, symbol: &str) -> Value {
        if let Some(profile) = self.finviz.get_company_overview(symbol).await {
            return profile;
        }
        serde_json::json!({
            "symbol": symbol.to_uppercase(),
            "company": symbol.to_uppercase(),
            "sector": "",
            "industry": "",
            "country": "",
            "market_cap": "",
            "pe": "",
            "dividend_yield": "",
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(date: String) -> HistoryRow {
        HistoryRow {
            symbol: "AAPL".into(),
            date,
            open: 100.0,
            high: 105.0,
            low: 99.0,
            close: 102.0,
            volume: 1_000_000,
        }
    }

    fn days_ago(n: i64) -> String {
        (Utc::now().date_naive() - Duration::days(n))
            .format("%Y-%m-%d")
            .to_string()
    }

    #[test]
    fn empty_history_is_stale() {
        assert!(is_history_stale(&[], 7));
    }

    #[test]
    fn staleness_boundary_is_inclusive() {
        // Exactly max_age_days old: fresh. One day older: stale.
        assert!(!is_history_stale(&[row(days_ago(7))], 7));
        assert!(is_history_stale(&[row(days_ago(8))], 7));
    }

    #[test]
    fn staleness_uses_last_row() {
        let rows = vec![row(days_ago(30)), row(days_ago(1))];
        assert!(!is_history_stale(&rows, 7));
    }

    #[test]
    fn invalid_dates_are_stale() {
        assert!(is_history_stale(&[row("not-a-date".into())], 7));
        assert!(is_history_stale(&[row(String::new())], 7));
    }

    #[test]
    fn period_mapping_table() {
        assert_eq!(map_days_to_period(30), ("month", 1));
        assert_eq!(map_days_to_period(31), ("month", 2));
        assert_eq!(map_days_to_period(60), ("month", 2));
        assert_eq!(map_days_to_period(90), ("month", 3));
        assert_eq!(map_days_to_period(180), ("month", 6));
        assert_eq!(map_days_to_period(365), ("year", 1));
        assert_eq!(map_days_to_period(730), ("year", 2));
        assert_eq!(map_days_to_period(1825), ("year", 5));
        assert_eq!(map_days_to_period(3650), ("year", 10));
    }

    #[test]
    fn normalize_history_handles_ms_and_iso() {
        let raw = serde_json::json!({
            "candles": [
                {"datetime": 1_705_320_000_000i64, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 10},
                {"datetime": "2024-06-01T00:00:00", "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.6, "volume": 11},
            ]
        });
        let rows = normalize_history(&raw, "aapl", 30);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].symbol, "AAPL");
        assert!(rows[0].date.len() == 10 && rows[0].date.contains('-'));
        assert_eq!(rows[1].date, "2024-06-01");
    }

    #[test]
    fn normalize_history_round_trips_regardless_of_time_format() {
        let ms = serde_json::json!({"candles": [
            {"datetime": 1_717_200_000_000i64, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 10}
        ]});
        let iso = serde_json::json!({"candles": [
            {"datetime": "2024-06-01T00:00:00Z", "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 10}
        ]});
        let a = normalize_history(&ms, "MSFT", 10);
        let b = normalize_history(&iso, "MSFT", 10);
        assert_eq!(a[0].date, b[0].date);
        assert_eq!(a[0].close, b[0].close);
    }

    #[test]
    fn normalize_history_keeps_last_n_rows() {
        let candles: Vec<Value> = (1..=10)
            .map(|d| {
                serde_json::json!({
                    "datetime": format!("2024-01-{d:02}T00:00:00"),
                    "open": 1.0, "high": 2.0, "low": 0.5, "close": d as f64, "volume": 1
                })
            })
            .collect();
        let raw = serde_json::json!({ "candles": candles });
        let rows = normalize_history(&raw, "AAPL", 5);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].date, "2024-01-06");
        assert_eq!(rows[4].date, "2024-01-10");
    }
}
