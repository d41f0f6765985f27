//! Alpaca market-data client (fallback provider behind Schwab).
//!
//! Uses the free-tier IEX feed; quote change fields are left at zero and
//! supplemented upstream when a previous close is available.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::warn;

use crate::cache::cache_get_or_fetch;
use crate::config::SETTINGS;
use crate::models::{HistoryRow, NewsArticle, Quote};

const DATA_URL: &str = "https://data.alpaca.markets/v2";
const NEWS_URL: &str = "https://data.alpaca.markets/v1beta1/news";

pub struct AlpacaClient {
    http: reqwest::Client,
}

impl AlpacaClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    fn configured(&self) -> bool {
        !SETTINGS.alpaca_api_key.is_empty()
    }

    async fn get_json(&self, url: &str, params: &[(String, String)]) -> Option<serde_json::Value> {
        let response = self
            .http
            .get(url)
            .header("APCA-API-KEY-ID", &SETTINGS.alpaca_api_key)
            .header("APCA-API-SECRET-KEY", &SETTINGS.alpaca_secret_key)
            .query(params)
            .send()
            .await
            .map_err(|e| warn!(url, error = %e, "Alpaca request failed"))
            .ok()?;
        if !response.status().is_success() {
            warn!(url, status = response.status().as_u16(), "Alpaca API error");
            return None;
        }
        response.json().await.ok()
    }

    pub async fn get_quote(&self, symbol: &str) -> Option<Quote> {
        if !self.configured() {
            return None;
        }
        let sym = symbol.to_uppercase();
        let key = format!("alpaca:quote:{sym}");
        cache_get_or_fetch(&key, "quote", || async {
            let url = format!("{DATA_URL}/stocks/{sym}/quotes/latest");
            let data = self
                .get_json(&url, &[("feed".to_string(), "iex".to_string())])
                .await?;
            let q = data.get("quote")?;
            let bid = q.get("bp").and_then(|v| v.as_f64());
            let ask = q.get("ap").and_then(|v| v.as_f64());
            let price = ask.filter(|p| *p > 0.0).or(bid)?;
            Some(Quote {
                symbol: sym.clone(),
                price: Some(price),
                change: Some(0.0),
                percent_change: Some(0.0),
                volume: None,
                bid,
                ask,
                open: None,
                close: None,
                high: None,
                low: None,
                week_52_high: None,
                week_52_low: None,
                pe_ratio: None,
                dividend_yield: None,
                timestamp: q.get("t").and_then(|v| v.as_str()).map(String::from),
                provider: "alpaca".to_string(),
            })
        })
        .await
    }

    pub async fn get_history(&self, symbol: &str, limit: usize) -> Option<Vec<HistoryRow>> {
        if !self.configured() {
            return None;
        }
        let sym = symbol.to_uppercase();
        let key = format!("alpaca:history:{sym}:1Day");
        cache_get_or_fetch(&key, "price_history", || async {
            let start = (Utc::now() - ChronoDuration::days(90)).format("%Y-%m-%dT%H:%M:%SZ");
            let url = format!("{DATA_URL}/stocks/{sym}/bars");
            let params = [
                ("timeframe".to_string(), "1Day".to_string()),
                ("limit".to_string(), limit.max(30).to_string()),
                ("feed".to_string(), "iex".to_string()),
                ("start".to_string(), start.to_string()),
            ];
            let data = self.get_json(&url, &params).await?;
            let bars = data.get("bars")?.as_array()?;
            if bars.is_empty() {
                return None;
            }
            let rows: Vec<HistoryRow> = bars
                .iter()
                .filter_map(|b| {
                    Some(HistoryRow {
                        symbol: sym.clone(),
                        date: b.get("t")?.as_str()?.split('T').next()?.to_string(),
                        open: b.get("o")?.as_f64()?,
                        high: b.get("h")?.as_f64()?,
                        low: b.get("l")?.as_f64()?,
                        close: b.get("c")?.as_f64()?,
                        volume: b.get("v")?.as_i64()?,
                    })
                })
                .collect();
            (!rows.is_empty()).then_some(rows)
        })
        .await
    }

    pub async fn get_news(&self, symbol: Option<&str>, limit: usize) -> Option<Vec<NewsArticle>> {
        let cache_symbol = symbol.map(|s| s.to_uppercase()).unwrap_or_else(|| "global".into());
        let key = format!("alpaca:news:{cache_symbol}:{limit}");
        cache_get_or_fetch(&key, "news", || async {
            let mut params = vec![("limit".to_string(), limit.to_string())];
            if let Some(sym) = symbol {
                params.push(("symbols".to_string(), sym.to_uppercase()));
            }
            let data = self.get_json(NEWS_URL, &params).await?;
            let news = data.get("news")?.as_array()?;
            Some(
                news.iter()
                    .map(|n| NewsArticle {
                        headline: n.get("headline").and_then(|v| v.as_str()).map(String::from),
                        summary: n.get("summary").and_then(|v| v.as_str()).map(String::from),
                        source: n.get("source").and_then(|v| v.as_str()).map(String::from),
                        url: n.get("url").and_then(|v| v.as_str()).map(String::from),
                        timestamp: n.get("created_at").and_then(|v| v.as_str()).map(String::from),
                        symbols: n
                            .get("symbols")
                            .and_then(|v| v.as_array())
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(|s| s.as_str().map(String::from))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                    .collect(),
            )
        })
        .await
    }

    pub async fn get_movers(&self, top: usize) -> Option<serde_json::Value> {
        if !self.configured() {
            return None;
        }
        cache_get_or_fetch("alpaca:movers", "quote", || async {
            let url = format!("{DATA_URL}/stocks/movers");
            let data = self.get_json(&url, &[]).await?;
            let gainers = data
                .get("gainers")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().take(top).cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            let losers = data
                .get("losers")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().take(top).cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            if gainers.is_empty() && losers.is_empty() {
                return None;
            }
            Some(serde_json::json!({ "gainers": gainers, "losers": losers }))
        })
        .await
    }
}

impl Default for AlpacaClient {
    fn default() -> Self {
        Self::new()
    }
}
