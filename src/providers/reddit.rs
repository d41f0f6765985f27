//! Reddit client for stock sentiment.
//!
//! Script-type OAuth (client credentials), keyword-lexicon sentiment over hot
//! and per-symbol search results across the stock subreddits.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::cache_get_or_fetch;
use crate::config::SETTINGS;

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_BASE: &str = "https://oauth.reddit.com";

const STOCK_SUBREDDITS: [&str; 14] = [
    "wallstreetbets",
    "stocks",
    "investing",
    "options",
    "stockmarket",
    "dividends",
    "SecurityAnalysis",
    "ValueInvesting",
    "pennystocks",
    "thetagang",
    "Daytrading",
    "algotrading",
    "FluentInFinance",
    "StockMarket",
];

const SENTIMENT_POSITIVE: [&str; 17] = [
    "bull", "calls", "moon", "rocket", "buy", "long", "pump", "green", "breakout", "undervalued",
    "squeeze", "diamond hands", "tendies", "to the moon", "ath", "all time high", "strong buy",
];
const SENTIMENT_NEGATIVE: [&str; 16] = [
    "bear", "puts", "crash", "dump", "sell", "short", "red", "overvalued", "bubble", "bag holder",
    "loss", "paper hands", "rug pull", "down", "recession", "correction",
];

lazy_static! {
    static ref DOLLAR_TICKER: Regex = Regex::new(r"\$([A-Z]{1,5})\b").unwrap();
    static ref BARE_TICKER: Regex = Regex::new(r"\b([A-Z]{3,5})\b").unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSentiment {
    pub score: f64,
    pub label: String,
    pub positive: usize,
    pub negative: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditPost {
    pub subreddit: String,
    pub title: String,
    pub score: i64,
    pub num_comments: i64,
    pub url: String,
    pub sentiment: PostSentiment,
    #[serde(default)]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendingPosts {
    pub posts: Vec<RedditPost>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockSentiment {
    pub symbol: String,
    pub overall_sentiment: String,
    pub sentiment_score: f64,
    pub post_count: usize,
    pub posts: Vec<RedditPost>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct RedditClient {
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl RedditClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(SETTINGS.reddit_user_agent.clone())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            token: Mutex::new(None),
        }
    }

    fn configured(&self) -> bool {
        !SETTINGS.reddit_client_id.is_empty() && !SETTINGS.reddit_client_secret.is_empty()
    }

    async fn access_token(&self) -> Option<String> {
        if !self.configured() {
            return None;
        }
        {
            let cached = self.token.lock();
            if let Some(ref t) = *cached {
                if t.expires_at > Instant::now() {
                    return Some(t.token.clone());
                }
            }
        }
        let basic = BASE64.encode(format!(
            "{}:{}",
            SETTINGS.reddit_client_id, SETTINGS.reddit_client_secret
        ));
        let response = self
            .http
            .post(TOKEN_URL)
            .header("Authorization", format!("Basic {basic}"))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| warn!(error = %e, "Reddit token request failed"))
            .ok()?;
        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "Reddit token error");
            return None;
        }
        let data: serde_json::Value = response.json().await.ok()?;
        let token = data.get("access_token")?.as_str()?.to_string();
        let expires_in = data.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(3600);
        *self.token.lock() = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        });
        Some(token)
    }

    async fn get_listing(&self, path: &str, params: &[(String, String)]) -> Option<Vec<serde_json::Value>> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{API_BASE}{path}"))
            .header("Authorization", format!("Bearer {token}"))
            .query(params)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let data: serde_json::Value = response.json().await.ok()?;
        Some(
            data.get("data")?
                .get("children")?
                .as_array()?
                .iter()
                .filter_map(|c| c.get("data").cloned())
                .collect(),
        )
    }

    fn post_from_value(sub: &str, raw: &serde_json::Value, with_symbols: bool) -> RedditPost {
        let title = raw.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let selftext: String = raw
            .get("selftext")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .chars()
            .take(500)
            .collect();
        let text = format!("{title} {selftext}");
        RedditPost {
            subreddit: sub.to_string(),
            title,
            score: raw.get("score").and_then(|v| v.as_i64()).unwrap_or(0),
            num_comments: raw.get("num_comments").and_then(|v| v.as_i64()).unwrap_or(0),
            url: format!(
                "https://reddit.com{}",
                raw.get("permalink").and_then(|v| v.as_str()).unwrap_or("")
            ),
            sentiment: analyze_sentiment(&text),
            symbols: if with_symbols { extract_symbols(&text) } else { Vec::new() },
        }
    }

    pub async fn get_trending_posts(&self, limit: usize) -> Option<TrendingPosts> {
        let key = format!("reddit:trending:{limit}");
        cache_get_or_fetch(&key, "reddit_sentiment", || async {
            if !self.configured() {
                return None;
            }
            let per_sub = (limit / 5).max(1);
            let mut posts = Vec::new();
            for sub in STOCK_SUBREDDITS.iter().copied().take(5) {
                let listing = self
                    .get_listing(
                        &format!("/r/{sub}/hot"),
                        &[("limit".to_string(), per_sub.to_string())],
                    )
                    .await;
                let Some(listing) = listing else {
                    warn!(subreddit = sub, "failed to fetch hot posts");
                    continue;
                };
                for raw in listing {
                    posts.push(Self::post_from_value(sub, &raw, true));
                }
            }
            posts.sort_by(|a, b| b.score.cmp(&a.score));
            posts.truncate(limit);
            let count = posts.len();
            Some(TrendingPosts { posts, count })
        })
        .await
    }

    pub async fn get_stock_sentiment(&self, symbol: &str, limit: usize) -> Option<StockSentiment> {
        let sym = symbol.to_uppercase();
        let key = format!("reddit:sentiment:{sym}");
        cache_get_or_fetch(&key, "reddit_sentiment", || async {
            if !self.configured() {
                return None;
            }
            let mut posts = Vec::new();
            let mut scores = Vec::new();
            for sub in STOCK_SUBREDDITS.iter().copied().take(8) {
                let listing = self
                    .get_listing(
                        &format!("/r/{sub}/search"),
                        &[
                            ("q".to_string(), sym.clone()),
                            ("restrict_sr".to_string(), "1".to_string()),
                            ("t".to_string(), "week".to_string()),
                            ("limit".to_string(), "5".to_string()),
                        ],
                    )
                    .await;
                let Some(listing) = listing else { continue };
                for raw in listing {
                    let post = Self::post_from_value(sub, &raw, false);
                    scores.push(post.sentiment.score);
                    posts.push(post);
                }
            }
            let avg = if scores.is_empty() {
                0.5
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            };
            let overall = if avg > 0.6 {
                "bullish"
            } else if avg < 0.4 {
                "bearish"
            } else {
                "neutral"
            };
            posts.sort_by(|a, b| b.score.cmp(&a.score));
            let post_count = posts.len();
            posts.truncate(limit);
            Some(StockSentiment {
                symbol: sym.clone(),
                overall_sentiment: overall.to_string(),
                sentiment_score: (avg * 100.0).round() / 100.0,
                post_count,
                posts,
            })
        })
        .await
    }
}

impl Default for RedditClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyword-lexicon sentiment over a post title + body snippet.
pub fn analyze_sentiment(text: &str) -> PostSentiment {
    let lower = text.to_lowercase();
    let pos = SENTIMENT_POSITIVE.iter().filter(|w| lower.contains(**w)).count();
    let neg = SENTIMENT_NEGATIVE.iter().filter(|w| lower.contains(**w)).count();
    let total = pos + neg;
    if total == 0 {
        return PostSentiment {
            score: 0.5,
            label: "neutral".to_string(),
            positive: 0,
            negative: 0,
        };
    }
    let score = pos as f64 / total as f64;
    let label = if score > 0.6 {
        "bullish"
    } else if score < 0.4 {
        "bearish"
    } else {
        "neutral"
    };
    PostSentiment {
        score: (score * 100.0).round() / 100.0,
        label: label.to_string(),
        positive: pos,
        negative: neg,
    }
}

const COMMON_WORDS: [&str; 44] = [
    "THE", "AND", "FOR", "ARE", "BUT", "NOT", "YOU", "ALL", "CAN", "HER", "WAS", "ONE", "OUR",
    "OUT", "HAS", "HIS", "HOW", "ITS", "LET", "MAY", "NEW", "NOW", "OLD", "SEE", "WAY", "WHO",
    "OIL", "DID", "GET", "HIM", "GOT", "TOP", "TOO", "ANY", "DAY", "HAD", "HOT", "FAR", "WHY",
    "JUST", "YOLO", "IMHO", "FWIW", "TLDR",
];

/// Extract up to 10 candidate tickers from free text.
pub fn extract_symbols(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cap in DOLLAR_TICKER.captures_iter(text) {
        let sym = cap[1].to_string();
        if seen.insert(sym.clone()) {
            out.push(sym);
        }
    }
    for cap in BARE_TICKER.captures_iter(text) {
        let sym = cap[1].to_string();
        if COMMON_WORDS.contains(&sym.as_str()) {
            continue;
        }
        if seen.insert(sym.clone()) {
            out.push(sym);
        }
    }
    out.truncate(10);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentiment_lexicons() {
        let bullish = analyze_sentiment("Huge breakout, strong buy, calls to the moon");
        assert_eq!(bullish.label, "bullish");
        assert!(bullish.positive >= 3);

        let bearish = analyze_sentiment("Total crash, dump it, puts only, bag holder city");
        assert_eq!(bearish.label, "bearish");

        let neutral = analyze_sentiment("Earnings call scheduled for Thursday");
        assert_eq!(neutral.label, "neutral");
        assert!((neutral.score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn symbol_extraction_skips_common_words() {
        let symbols = extract_symbols("$NVDA AND TSLA ARE THE TOP PLAYS, NOT OIL");
        assert!(symbols.contains(&"NVDA".to_string()));
        assert!(symbols.contains(&"TSLA".to_string()));
        assert!(!symbols.contains(&"AND".to_string()));
        assert!(!symbols.contains(&"OIL".to_string()));
    }
}
