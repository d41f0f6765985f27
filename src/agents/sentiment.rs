//! Sentiment agent: Reddit, news, and congressional-trading sentiment,
//! gated by query keywords and fetched concurrently per source.

use anyhow::Result;
use futures_util::future::join_all;
use serde_json::{json, Value};

use crate::agents::{agent_query, extract_symbols, status_for_all, AgentContext};
use crate::models::{AgentName, AgentResult, AgentTask, AgentUpdate, TaskState};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Source {
    Reddit,
    News,
    Capitol,
    RedditTrending,
    CapitolTrending,
}

fn wants(query_lower: &str, words: &[&str]) -> bool {
    words.iter().any(|w| query_lower.contains(w))
}

/// Decide which sources to hit for this query.
fn plan_sources(query: &str, symbols: &[String]) -> Vec<(Source, Option<String>)> {
    let lower = query.to_lowercase();
    let mut wants_reddit = wants(&lower, &["reddit", "social", "sentiment", "wsb", "wallstreetbets"]);
    let wants_capitol = wants(
        &lower,
        &["congress", "capitol", "political", "politician", "senator", "representative"],
    );
    let mut wants_news = wants(&lower, &["news", "headline"]);

    // A bare symbol gets the full spread; no symbol falls back to trending.
    if !symbols.is_empty() && !(wants_reddit || wants_capitol || wants_news) {
        wants_reddit = true;
        wants_news = true;
    }
    if symbols.is_empty() && !wants_capitol {
        wants_reddit = true;
    }

    let mut tasks = Vec::new();
    if symbols.is_empty() {
        if wants_reddit {
            tasks.push((Source::RedditTrending, None));
        }
        if wants_capitol {
            tasks.push((Source::CapitolTrending, None));
        }
        return tasks;
    }
    for sym in symbols.iter().take(2) {
        if wants_reddit {
            tasks.push((Source::Reddit, Some(sym.clone())));
        }
        if wants_news {
            tasks.push((Source::News, Some(sym.clone())));
        }
        if wants_capitol {
            tasks.push((Source::Capitol, Some(sym.clone())));
        }
    }
    tasks
}

pub async fn run(ctx: &AgentContext<'_>, ready: &[AgentTask]) -> Result<AgentUpdate> {
    let query = agent_query(ctx, ready, "Run these sentiment analysis requests");
    let symbols = extract_symbols(&query, 5);
    let sources = plan_sources(&query, &symbols);

    let fetches = sources.iter().map(|(source, sym)| {
        let sym = sym.clone();
        async move {
            let key = match (source, &sym) {
                (Source::Reddit, Some(s)) => format!("reddit:{s}"),
                (Source::News, Some(s)) => format!("news:{s}"),
                (Source::Capitol, Some(s)) => format!("capitol:{s}"),
                (Source::RedditTrending, _) => "reddit_trending".to_string(),
                (Source::CapitolTrending, _) => "capitol_trending".to_string(),
                _ => return None,
            };
            let value: Option<Value> = match source {
                Source::Reddit => ctx
                    .deps
                    .reddit
                    .get_stock_sentiment(sym.as_deref().unwrap_or(""), 15)
                    .await
                    .and_then(|v| serde_json::to_value(v).ok()),
                Source::News => ctx
                    .deps
                    .tavily
                    .get_news_sentiment(sym.as_deref().unwrap_or(""))
                    .await
                    .and_then(|v| serde_json::to_value(v).ok()),
                Source::Capitol => ctx
                    .deps
                    .tavily
                    .get_political_trades(sym.as_deref())
                    .await
                    .and_then(|v| serde_json::to_value(v).ok()),
                Source::RedditTrending => ctx
                    .deps
                    .reddit
                    .get_trending_posts(15)
                    .await
                    .and_then(|v| serde_json::to_value(v).ok()),
                Source::CapitolTrending => ctx
                    .deps
                    .tavily
                    .get_political_trades(None)
                    .await
                    .and_then(|v| serde_json::to_value(v).ok()),
            };
            value.map(|v| (key, v))
        }
    });

    let mut results = serde_json::Map::new();
    for entry in join_all(fetches).await.into_iter().flatten() {
        results.insert(entry.0, entry.1);
    }

    let content = format_sentiment(&results);
    let mut update = AgentUpdate::default();
    update.task_status.extend(status_for_all(ready, TaskState::Completed));
    update.agent_results.insert(
        AgentName::Sentiment,
        AgentResult {
            agent: AgentName::Sentiment,
            content,
            symbols,
            data: Some(Value::Object(results)),
            error: None,
        },
    );
    Ok(update)
}

fn display(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "N/A".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
    }
}

fn clip(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn format_sentiment(results: &serde_json::Map<String, Value>) -> String {
    let mut parts = Vec::new();
    for (key, data) in results {
        if let Some(sym) = key.strip_prefix("reddit:") {
            parts.push(format!(
                "**Reddit Sentiment — {sym}**\nOverall: {} (Score: {})\nPosts analyzed: {}",
                display(data.get("overall_sentiment")).to_uppercase(),
                display(data.get("sentiment_score")),
                display(data.get("post_count")),
            ));
            if let Some(posts) = data.get("posts").and_then(|v| v.as_array()) {
                for p in posts.iter().take(3) {
                    parts.push(format!(
                        "  - r/{}: {} (Score: {})",
                        display(p.get("subreddit")),
                        clip(&display(p.get("title")), 80),
                        display(p.get("score")),
                    ));
                }
            }
        } else if key == "reddit_trending" {
            if let Some(posts) = data.get("posts").and_then(|v| v.as_array()) {
                if posts.is_empty() {
                    continue;
                }
                let mut lines = vec!["**Trending on Reddit**".to_string()];
                for p in posts.iter().take(8) {
                    let label = p
                        .get("sentiment")
                        .and_then(|s| s.get("label"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("neutral");
                    lines.push(format!(
                        "  r/{} | {} (Score: {}, {label})",
                        display(p.get("subreddit")),
                        clip(&display(p.get("title")), 70),
                        display(p.get("score")),
                    ));
                }
                parts.push(lines.join("\n"));
            }
        } else if let Some(sym) = key.strip_prefix("news:") {
            parts.push(format!(
                "**News Sentiment — {sym}**\nOverall: {} (Score: {})",
                display(data.get("news_sentiment")).to_uppercase(),
                display(data.get("sentiment_score")),
            ));
            if let Some(articles) = data.get("articles").and_then(|v| v.as_array()) {
                for a in articles.iter().take(3) {
                    parts.push(format!("  - {}", clip(&display(a.get("title")), 80)));
                }
            }
        } else if key.starts_with("capitol") {
            let title = match key.strip_prefix("capitol:") {
                Some(sym) => format!("Congressional Trading — {sym}"),
                None => "Congressional Trading Activity".to_string(),
            };
            if let Some(hits) = data.get("results").and_then(|v| v.as_array()) {
                if hits.is_empty() {
                    continue;
                }
                let mut lines = vec![format!("**{title}**")];
                for r in hits.iter().take(5) {
                    lines.push(format!("  - {}", clip(&display(r.get("title")), 80)));
                }
                parts.push(lines.join("\n"));
            }
        }
    }
    if parts.is_empty() {
        "No sentiment data available for this query.".to_string()
    } else {
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_query_defaults_to_reddit_and_news() {
        let sources = plan_sources("How do people feel about TSLA?", &["TSLA".to_string()]);
        let kinds: Vec<Source> = sources.iter().map(|(s, _)| *s).collect();
        assert!(kinds.contains(&Source::Reddit));
        assert!(kinds.contains(&Source::News));
        assert!(!kinds.contains(&Source::Capitol));
    }

    #[test]
    fn capitol_keywords_add_political_source() {
        let sources = plan_sources("congress trades in NVDA", &["NVDA".to_string()]);
        assert!(sources.iter().any(|(s, _)| *s == Source::Capitol));
    }

    #[test]
    fn no_symbols_falls_back_to_trending() {
        let sources = plan_sources("what's the market mood", &[]);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0, Source::RedditTrending);
    }

    #[test]
    fn at_most_two_symbols_fan_out() {
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string(), "NVDA".to_string()];
        let sources = plan_sources("reddit and news sentiment", &symbols);
        let reddit_count = sources.iter().filter(|(s, _)| *s == Source::Reddit).count();
        assert_eq!(reddit_count, 2);
    }

    #[test]
    fn formatting_handles_empty_map() {
        let out = format_sentiment(&serde_json::Map::new());
        assert_eq!(out, "No sentiment data available for this query.");
    }

    #[test]
    fn reddit_section_renders() {
        let mut results = serde_json::Map::new();
        results.insert(
            "reddit:TSLA".to_string(),
            json!({
                "overall_sentiment": "bullish",
                "sentiment_score": 0.72,
                "post_count": 12,
                "posts": [{"subreddit": "wallstreetbets", "title": "TSLA calls printing", "score": 900}],
            }),
        );
        let out = format_sentiment(&results);
        assert!(out.contains("**Reddit Sentiment — TSLA**"));
        assert!(out.contains("Overall: BULLISH"));
        assert!(out.contains("r/wallstreetbets"));
    }
}
