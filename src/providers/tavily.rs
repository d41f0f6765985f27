//! Tavily web search: news and congressional-trading lookups for the
//! sentiment agent and the report builders.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::cache_get_or_fetch;
use crate::config::SETTINGS;

const TAVILY_URL: &str = "https://api.tavily.com/search";

const FINANCIAL_DOMAINS: [&str; 10] = [
    "reuters.com",
    "bloomberg.com",
    "wsj.com",
    "cnbc.com",
    "marketwatch.com",
    "seekingalpha.com",
    "finance.yahoo.com",
    "barrons.com",
    "investopedia.com",
    "fool.com",
];

const CAPITOL_DOMAINS: [&str; 6] = [
    "capitoltrades.com",
    "quiverquant.com",
    "reuters.com",
    "bloomberg.com",
    "wsj.com",
    "cnbc.com",
];

const POSITIVE_WORDS: [&str; 9] = [
    "surge", "rally", "gain", "beat", "upgrade", "buy", "bullish", "growth", "strong",
];
const NEGATIVE_WORDS: [&str; 9] = [
    "drop", "fall", "miss", "downgrade", "sell", "bearish", "decline", "weak", "crash",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsSentiment {
    pub symbol: String,
    pub news_sentiment: String,
    pub sentiment_score: f64,
    pub articles: Vec<SearchHit>,
}

pub struct TavilyClient {
    http: reqwest::Client,
}

impl TavilyClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    pub async fn search(
        &self,
        query: &str,
        domains: Option<&[&str]>,
        max_results: usize,
    ) -> Option<SearchResult> {
        if SETTINGS.tavily_api_key.is_empty() {
            return None;
        }
        let mut payload = serde_json::json!({
            "api_key": SETTINGS.tavily_api_key,
            "query": query,
            "search_depth": "advanced",
            "max_results": max_results,
        });
        if let Some(domains) = domains {
            payload["include_domains"] = serde_json::json!(domains);
        }
        let response = self
            .http
            .post(TAVILY_URL)
            .json(&payload)
            .send()
            .await
            .map_err(|e| warn!(error = %e, "Tavily search failed"))
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let data: serde_json::Value = response.json().await.ok()?;
        let results = data
            .get("results")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|r| SearchHit {
                        title: r.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        url: r.get("url").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        content: r
                            .get("content")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        score: r.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(SearchResult {
            query: query.to_string(),
            results,
        })
    }

    pub async fn search_financial_news(&self, query: &str, limit: usize) -> Option<SearchResult> {
        let key = format!("tavily:news:{query}");
        cache_get_or_fetch(&key, "news", || async {
            self.search(query, Some(&FINANCIAL_DOMAINS), limit).await
        })
        .await
    }

    pub async fn search_capitol_trades(&self, query: &str, limit: usize) -> Option<SearchResult> {
        let key = format!("tavily:capitol:{query}");
        cache_get_or_fetch(&key, "news", || async {
            self.search(query, Some(&CAPITOL_DOMAINS), limit).await
        })
        .await
    }

    pub async fn get_political_trades(&self, symbol: Option<&str>) -> Option<SearchResult> {
        let query = match symbol {
            Some(sym) => format!("congress trading {sym} stock recent activity"),
            None => "congressional stock trading recent activity".to_string(),
        };
        self.search_capitol_trades(&query, 5).await
    }

    pub async fn get_news_sentiment(&self, symbol: &str) -> Option<NewsSentiment> {
        let sym = symbol.to_uppercase();
        let key = format!("tavily:sentiment:{sym}");
        cache_get_or_fetch(&key, "news", || async {
            let result = self
                .search(
                    &format!("{sym} stock news analysis"),
                    Some(&FINANCIAL_DOMAINS),
                    8,
                )
                .await?;
            let (score, label) = score_headlines(&result.results);
            Some(NewsSentiment {
                symbol: sym.clone(),
                news_sentiment: label,
                sentiment_score: score,
                articles: result.results.into_iter().take(5).collect(),
            })
        })
        .await
    }
}

impl Default for TavilyClient {
    fn default() -> Self {
        Self::new()
    }
}

fn score_headlines(hits: &[SearchHit]) -> (f64, String) {
    let mut pos = 0usize;
    let mut neg = 0usize;
    for hit in hits {
        let text = format!("{} {}", hit.title, hit.content).to_lowercase();
        pos += POSITIVE_WORDS.iter().filter(|w| text.contains(**w)).count();
        neg += NEGATIVE_WORDS.iter().filter(|w| text.contains(**w)).count();
    }
    let total = pos + neg;
    let score = if total > 0 { pos as f64 / total as f64 } else { 0.5 };
    let label = if score > 0.6 {
        "bullish"
    } else if score < 0.4 {
        "bearish"
    } else {
        "neutral"
    };
    ((score * 100.0).round() / 100.0, label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(title: &str) -> SearchHit {
        SearchHit {
            title: title.to_string(),
            url: String::new(),
            content: String::new(),
            score: 0.5,
        }
    }

    #[test]
    fn headline_scoring_labels() {
        let (score, label) = score_headlines(&[hit("Shares surge after earnings beat")]);
        assert!(score > 0.6);
        assert_eq!(label, "bullish");

        let (score, label) = score_headlines(&[hit("Stock drops on downgrade, sell pressure")]);
        assert!(score < 0.4);
        assert_eq!(label, "bearish");

        let (score, label) = score_headlines(&[hit("Company announces new office")]);
        assert!((score - 0.5).abs() < f64::EPSILON);
        assert_eq!(label, "neutral");
    }
}
