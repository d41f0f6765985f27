//! Finviz quote-page scraper: company overview, analyst ratings, insider
//! trades, and company news.
//!
//! Finviz has no public JSON API; the quote page is fetched once per call and
//! parsed synchronously before any await point (scraper's DOM is not Send).
//! Results are cached under the long fundamentals TTLs.

use std::collections::HashMap;
use std::time::Duration;

use scraper::{Html, Selector};
use tracing::warn;

use crate::cache::cache_get_or_fetch;

const QUOTE_URL: &str = "https://finviz.com/quote.ashx";
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

pub struct FinvizClient {
    http: reqwest::Client,
}

impl FinvizClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    async fn fetch_quote_page(&self, symbol: &str) -> Option<String> {
        let response = self
            .http
            .get(QUOTE_URL)
            .query(&[("t", symbol.to_uppercase().as_str())])
            .send()
            .await
            .map_err(|e| warn!(symbol, error = %e, "Finviz request failed"))
            .ok()?;
        if !response.status().is_success() {
            warn!(symbol, status = response.status().as_u16(), "Finviz page error");
            return None;
        }
        response.text().await.ok()
    }

    pub async fn get_company_overview(&self, symbol: &str) -> Option<serde_json::Value> {
        let sym = symbol.to_uppercase();
        let key = format!("finviz:overview:{sym}");
        cache_get_or_fetch(&key, "analyst_ratings", || async {
            let html = self.fetch_quote_page(&sym).await?;
            parse_overview(&html, &sym)
        })
        .await
    }

    pub async fn get_analyst_ratings(&self, symbol: &str) -> Option<serde_json::Value> {
        let sym = symbol.to_uppercase();
        let key = format!("finviz:ratings:{sym}");
        cache_get_or_fetch(&key, "analyst_ratings", || async {
            let html = self.fetch_quote_page(&sym).await?;
            let ratings = parse_ratings(&html);
            let count = ratings.len();
            Some(serde_json::json!({
                "symbol": sym,
                "ratings": ratings,
                "count": count,
            }))
        })
        .await
    }

    pub async fn get_insider_trades(&self, symbol: &str, limit: usize) -> Option<serde_json::Value> {
        let sym = symbol.to_uppercase();
        let key = format!("finviz:insider:{sym}");
        cache_get_or_fetch(&key, "insider_trades", || async {
            let html = self.fetch_quote_page(&sym).await?;
            let trades: Vec<serde_json::Value> = parse_insider_trades(&html).into_iter().take(limit).collect();
            let count = trades.len();
            Some(serde_json::json!({
                "symbol": sym,
                "insider_trades": trades,
                "count": count,
            }))
        })
        .await
    }

    pub async fn get_company_news(&self, symbol: &str, limit: usize) -> Option<serde_json::Value> {
        let sym = symbol.to_uppercase();
        let key = format!("finviz:news:{sym}");
        cache_get_or_fetch(&key, "news", || async {
            let html = self.fetch_quote_page(&sym).await?;
            let articles: Vec<serde_json::Value> = parse_news(&html).into_iter().take(limit).collect();
            let count = articles.len();
            Some(serde_json::json!({
                "symbol": sym,
                "news": articles,
                "count": count,
            }))
        })
        .await
    }
}

impl Default for FinvizClient {
    fn default() -> Self {
        Self::new()
    }
}

fn cell_text(el: scraper::ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Snapshot table: label/value cells alternate left to right.
fn parse_snapshot_map(doc: &Html) -> HashMap<String, String> {
    let cell_sel = Selector::parse("table.snapshot-table2 td").unwrap();
    let cells: Vec<String> = doc.select(&cell_sel).map(cell_text).collect();
    let mut map = HashMap::new();
    for pair in cells.chunks(2) {
        if let [label, value] = pair {
            if !label.is_empty() {
                map.insert(label.clone(), value.clone());
            }
        }
    }
    map
}

fn parse_overview(html: &str, symbol: &str) -> Option<serde_json::Value> {
    let doc = Html::parse_document(html);
    let info = parse_snapshot_map(&doc);
    if info.is_empty() {
        return None;
    }

    let title_sel = Selector::parse("h2.quote-header_ticker-wrapper_company a, a.tab-link").unwrap();
    let company = doc.select(&title_sel).next().map(cell_text).unwrap_or_default();
    let links_sel = Selector::parse("div.quote-links a.tab-link").unwrap();
    let sector_links: Vec<String> = doc.select(&links_sel).take(3).map(cell_text).collect();
    let get = |k: &str| info.get(k).cloned().unwrap_or_default();

    Some(serde_json::json!({
        "symbol": symbol,
        "company": if company.is_empty() { symbol.to_string() } else { company },
        "sector": sector_links.first().cloned().unwrap_or_default(),
        "industry": sector_links.get(1).cloned().unwrap_or_default(),
        "country": sector_links.get(2).cloned().unwrap_or_default(),
        "market_cap": get("Market Cap"),
        "pe": get("P/E"),
        "forward_pe": get("Forward P/E"),
        "peg": get("PEG"),
        "ps": get("P/S"),
        "pb": get("P/B"),
        "payout_ratio": get("Payout"),
        "eps": get("EPS (ttm)"),
        "eps_next_y": get("EPS next Y"),
        "eps_past_5y": get("EPS past 5Y"),
        "sales_past_5y": get("Sales past 5Y"),
        "dividend_yield": get("Dividend %"),
        "roe": get("ROE"),
        "roi": get("ROI"),
        "debt_eq": get("Debt/Eq"),
        "gross_margin": get("Gross Margin"),
        "oper_margin": get("Oper. Margin"),
        "profit_margin": get("Profit Margin"),
        "revenue": get("Revenue"),
        "income": get("Income"),
        "employees": get("Employees"),
        "short_float": get("Short Float"),
        "target_price": get("Target Price"),
        "52w_range": get("52W Range"),
        "rsi_14": get("RSI (14)"),
        "avg_volume": get("Avg Volume"),
        "rel_volume": get("Rel Volume"),
        "beta": get("Beta"),
        "sma20": get("SMA20"),
        "sma50": get("SMA50"),
        "sma200": get("SMA200"),
    }))
}

fn parse_ratings(html: &str) -> Vec<serde_json::Value> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("table.js-table-ratings tr, table.fullview-ratings-outer tr").unwrap();
    let td_sel = Selector::parse("td").unwrap();
    let mut out = Vec::new();
    for row in doc.select(&row_sel) {
        let cells: Vec<String> = row.select(&td_sel).map(cell_text).collect();
        if cells.len() < 5 || cells[0].is_empty() {
            continue;
        }
        out.push(serde_json::json!({
            "date": cells[0],
            "action": cells[1],
            "analyst": cells[2],
            "rating": cells[3],
            "price_target": cells[4],
        }));
        if out.len() >= 10 {
            break;
        }
    }
    out
}

fn parse_insider_trades(html: &str) -> Vec<serde_json::Value> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("table.body-table tr, table.insider-sales-table tr").unwrap();
    let td_sel = Selector::parse("td").unwrap();
    let mut out = Vec::new();
    for row in doc.select(&row_sel) {
        let cells: Vec<String> = row.select(&td_sel).map(cell_text).collect();
        if cells.len() < 7 {
            continue;
        }
        // Skip the header row.
        if cells[0].eq_ignore_ascii_case("insider trading") {
            continue;
        }
        out.push(serde_json::json!({
            "insider": cells[0],
            "relationship": cells[1],
            "date": cells[2],
            "transaction": cells[3],
            "value": cells.get(5).cloned().unwrap_or_default(),
            "shares": cells.get(6).cloned().unwrap_or_default(),
        }));
    }
    out
}

fn parse_news(html: &str) -> Vec<serde_json::Value> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("table.fullview-news-outer tr, table.news-table tr").unwrap();
    let td_sel = Selector::parse("td").unwrap();
    let link_sel = Selector::parse("a").unwrap();
    let mut out = Vec::new();
    let mut last_date = String::new();
    for row in doc.select(&row_sel) {
        let cells: Vec<scraper::ElementRef<'_>> = row.select(&td_sel).collect();
        if cells.len() < 2 {
            continue;
        }
        let date_text = cell_text(cells[0]);
        if !date_text.is_empty() {
            last_date = date_text;
        }
        let Some(link) = cells[1].select(&link_sel).next() else {
            continue;
        };
        let headline = cell_text(link);
        if headline.is_empty() {
            continue;
        }
        let full = cell_text(cells[1]);
        let source = match full.rfind('(') {
            Some(idx) => full[idx + 1..].trim_end_matches(')').trim().to_string(),
            None => String::new(),
        };
        out.push(serde_json::json!({
            "date": last_date,
            "headline": headline,
            "source": source,
            "link": link.value().attr("href").unwrap_or_default(),
        }));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT_HTML: &str = r#"
        <html><body>
        <div class="quote-links">
          <a class="tab-link">Technology</a>
          <a class="tab-link">Consumer Electronics</a>
          <a class="tab-link">USA</a>
        </div>
        <table class="snapshot-table2">
          <tr><td>Market Cap</td><td>3.21T</td><td>P/E</td><td>33.5</td></tr>
          <tr><td>ROE</td><td>147.2%</td><td>Debt/Eq</td><td>1.45</td></tr>
          <tr><td>Dividend %</td><td>0.44%</td><td>Beta</td><td>1.29</td></tr>
        </table>
        <table class="js-table-ratings">
          <tr><td>Jul-22-25</td><td>Reiterated</td><td>Morgan Stanley</td><td>Overweight</td><td>$230</td></tr>
        </table>
        <table class="fullview-news-outer">
          <tr><td>Jul-23-25 08:01AM</td><td><a href="https://example.com/a">Apple beats estimates</a> (Reuters)</td></tr>
          <tr><td></td><td><a href="https://example.com/b">Second headline</a> (WSJ)</td></tr>
        </table>
        </body></html>
    "#;

    #[test]
    fn overview_parses_snapshot_fields() {
        let overview = parse_overview(SNAPSHOT_HTML, "AAPL").unwrap();
        assert_eq!(overview["symbol"], "AAPL");
        assert_eq!(overview["market_cap"], "3.21T");
        assert_eq!(overview["pe"], "33.5");
        assert_eq!(overview["debt_eq"], "1.45");
        assert_eq!(overview["sector"], "Technology");
        assert_eq!(overview["country"], "USA");
    }

    #[test]
    fn overview_is_none_without_snapshot_table() {
        assert!(parse_overview("<html><body></body></html>", "AAPL").is_none());
    }

    #[test]
    fn ratings_rows_parse() {
        let ratings = parse_ratings(SNAPSHOT_HTML);
        assert_eq!(ratings.len(), 1);
        assert_eq!(ratings[0]["analyst"], "Morgan Stanley");
        assert_eq!(ratings[0]["rating"], "Overweight");
    }

    #[test]
    fn news_rows_inherit_dates() {
        let news = parse_news(SNAPSHOT_HTML);
        assert_eq!(news.len(), 2);
        assert_eq!(news[0]["headline"], "Apple beats estimates");
        assert_eq!(news[0]["source"], "Reuters");
        // Second row has an empty date cell and inherits the prior date.
        assert_eq!(news[1]["date"], news[0]["date"]);
    }
}
