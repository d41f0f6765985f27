//! Schwab API client with dual app support, retries, and observability.
//!
//! Two logical apps share the implementation: `market` (quotes, history,
//! movers, hours) and `trader` (accounts, orders, transactions). Credentials
//! and token files are separate per app; token refresh is serialized per app.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{TimeZone, Utc};
use rand::Rng;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::cache::cache_get_or_fetch;
use crate::config::SETTINGS;
use crate::models::{Mover, MoversReport, Quote};
use crate::providers::observability::BrokerEventRing;

const AUTH_BASE_URL: &str = "https://api.schwabapi.com/v1/oauth/authorize";
const TOKEN_URL: &str = "https://api.schwabapi.com/v1/oauth/token";
const MARKETDATA_BASE_URL: &str = "https://api.schwabapi.com/marketdata/v1";
const TRADER_BASE_URL: &str = "https://api.schwabapi.com/trader/v1";

pub const APP_MARKET: &str = "market";
pub const APP_TRADER: &str = "trader";

const RETRY_STATUSES: [u16; 4] = [429, 502, 503, 504];

fn normalize_app(app_type: &str) -> &'static str {
    match app_type.trim().to_lowercase().as_str() {
        "trader" => APP_TRADER,
        _ => APP_MARKET,
    }
}

fn credentials(app: &str) -> (String, String) {
    if app == APP_TRADER {
        (
            SETTINGS.schwab_trader_client_id.clone(),
            SETTINGS.schwab_trader_client_secret.clone(),
        )
    } else {
        (
            SETTINGS.schwab_market_client_id.clone(),
            SETTINGS.schwab_market_client_secret.clone(),
        )
    }
}

fn token_path(app: &str) -> PathBuf {
    if app == APP_TRADER {
        PathBuf::from(&SETTINGS.schwab_trader_token_path)
    } else {
        PathBuf::from(&SETTINGS.schwab_market_token_path)
    }
}

fn read_token_file(app: &str) -> Option<serde_json::Value> {
    let path = token_path(app);
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_token_file(app: &str, payload: &serde_json::Value) -> Result<()> {
    let path = token_path(app);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::write(&path, serde_json::to_string_pretty(payload)?)
        .with_context(|| format!("write token file {}", path.display()))
}

fn token_is_expired(payload: &serde_json::Value, app: &str) -> bool {
    let expires_in = payload.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(0);
    if expires_in <= 0 {
        return true;
    }
    let path = token_path(app);
    let Ok(meta) = std::fs::metadata(&path) else {
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return true;
    };
    let issued_at = modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64;
    now >= issued_at + expires_in - 60
}

fn retry_delay(attempt: u32) -> Duration {
    let base = SETTINGS.schwab_retry_backoff_seconds.max(0.05);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.1);
    Duration::from_secs_f64(base * 2f64.powi(attempt as i32 - 1) + jitter)
}

fn basic_auth_header(app: &str) -> Option<String> {
    let (id, secret) = credentials(app);
    if id.is_empty() || secret.is_empty() {
        return None;
    }
    Some(format!("Basic {}", BASE64.encode(format!("{id}:{secret}"))))
}

#[derive(Clone, Copy)]
enum RequestBody<'a> {
    None,
    Form(&'a [(&'a str, &'a str)]),
    Json(&'a serde_json::Value),
}

pub struct SchwabClient {
    http: reqwest::Client,
    ring: Arc<BrokerEventRing>,
    market_refresh: tokio::sync::Mutex<()>,
    trader_refresh: tokio::sync::Mutex<()>,
}

impl SchwabClient {
    pub fn new(ring: Arc<BrokerEventRing>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(SETTINGS.schwab_http_timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            ring,
            market_refresh: tokio::sync::Mutex::new(()),
            trader_refresh: tokio::sync::Mutex::new(()),
        }
    }

    fn refresh_lock(&self, app: &str) -> &tokio::sync::Mutex<()> {
        if app == APP_TRADER {
            &self.trader_refresh
        } else {
            &self.market_refresh
        }
    }

    /// Run one logical request with retry on transient statuses and
    /// transport errors, recording every attempt on the observability ring.
    async fn request_with_retry(
        &self,
        method: reqwest::Method,
        url: &str,
        app: &str,
        endpoint: &str,
        bearer: Option<&str>,
        basic: Option<&str>,
        params: Option<&[(String, String)]>,
        body: RequestBody<'_>,
    ) -> Option<reqwest::Response> {
        let attempts = SETTINGS.schwab_max_retries.max(1);
        for attempt in 1..=attempts {
            let mut request = self.http.request(method.clone(), url);
            if let Some(token) = bearer {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
            if let Some(auth) = basic {
                request = request.header("Authorization", auth);
            }
            if let Some(query) = params {
                request = request.query(query);
            }
            match body {
                RequestBody::None => {}
                RequestBody::Form(fields) => request = request.form(fields),
                RequestBody::Json(json) => request = request.json(json),
            }

            let started = Instant::now();
            match request.send().await {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let status = response.status().as_u16();
                    let request_id = response
                        .headers()
                        .get("x-request-id")
                        .or_else(|| response.headers().get("request-id"))
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.to_string());
                    let success = status < 400;
                    let error = if success {
                        None
                    } else {
                        Some(format!("HTTP {status}"))
                    };
                    self.ring.record(
                        "schwab",
                        app,
                        endpoint,
                        method.as_str(),
                        Some(status),
                        attempt,
                        Some(latency_ms),
                        success,
                        error,
                        request_id,
                    );

                    if RETRY_STATUSES.contains(&status) && attempt < attempts {
                        let delay = retry_delay(attempt);
                        debug!(endpoint, status, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Some(response);
                }
                Err(e) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let error_text = format!("{}: {e}", if e.is_timeout() { "Timeout" } else { "Transport" });
                    self.ring.record(
                        "schwab",
                        app,
                        endpoint,
                        method.as_str(),
                        None,
                        attempt,
                        Some(latency_ms),
                        false,
                        Some(error_text.clone()),
                        None,
                    );
                    if attempt >= attempts {
                        self.ring.set_last_error(app, error_text);
                        return None;
                    }
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
            }
        }
        None
    }

    // ── OAuth ────────────────────────────────────────────

    pub fn build_authorize_url(&self, scope: &str, state: Option<&str>, app_type: &str) -> String {
        let app = normalize_app(app_type);
        let (client_id, _) = credentials(app);
        let mut url = format!(
            "{AUTH_BASE_URL}?response_type=code&client_id={}&redirect_uri={}&scope={}",
            client_id, SETTINGS.schwab_redirect_uri, scope
        );
        if let Some(state) = state {
            url.push_str(&format!("&state={state}"));
        }
        url
    }

    pub async fn exchange_auth_code_for_token(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
        app_type: &str,
    ) -> Result<serde_json::Value> {
        let app = normalize_app(app_type);
        let basic = basic_auth_header(app)
            .ok_or_else(|| anyhow::anyhow!("Missing Schwab credentials for app '{app}'"))?;
        let redirect = redirect_uri.unwrap_or(&SETTINGS.schwab_redirect_uri).to_string();
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect.as_str()),
        ];
        let response = self
            .request_with_retry(
                reqwest::Method::POST,
                TOKEN_URL,
                app,
                "/oauth/token",
                None,
                Some(&basic),
                None,
                RequestBody::Form(&form),
            )
            .await
            .context("Token exchange failed: network/timeout")?;

        if response.status() != StatusCode::OK {
            anyhow::bail!(
                "Token exchange failed: {} {}",
                response.status().as_u16(),
                response.text().await.unwrap_or_default()
            );
        }
        let payload: serde_json::Value = response.json().await.context("decode token payload")?;
        write_token_file(app, &payload)?;
        Ok(payload)
    }

    pub async fn refresh_auth_token(
        &self,
        refresh_token: Option<&str>,
        app_type: &str,
    ) -> Result<serde_json::Value> {
        let app = normalize_app(app_type);
        // One refresh at a time per app; racing refreshes invalidate each other.
        let _guard = self.refresh_lock(app).lock().await;

        let token_data = read_token_file(app).unwrap_or_else(|| serde_json::json!({}));
        let rt = refresh_token
            .map(|t| t.to_string())
            .or_else(|| {
                token_data
                    .get("refresh_token")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            })
            .ok_or_else(|| anyhow::anyhow!("No refresh token available"))?;

        let basic = basic_auth_header(app)
            .ok_or_else(|| anyhow::anyhow!("Missing Schwab credentials for app '{app}'"))?;
        let form = [("grant_type", "refresh_token"), ("refresh_token", rt.as_str())];
        let response = self
            .request_with_retry(
                reqwest::Method::POST,
                TOKEN_URL,
                app,
                "/oauth/token",
                None,
                Some(&basic),
                None,
                RequestBody::Form(&form),
            )
            .await
            .context("Token refresh failed: network/timeout")?;

        if response.status() != StatusCode::OK {
            anyhow::bail!(
                "Token refresh failed: {} {}",
                response.status().as_u16(),
                response.text().await.unwrap_or_default()
            );
        }
        let payload: serde_json::Value = response.json().await.context("decode refresh payload")?;
        let mut merged = token_data;
        if let (Some(base), Some(patch)) = (merged.as_object_mut(), payload.as_object()) {
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
        }
        write_token_file(app, &merged)?;
        Ok(merged)
    }

    async fn valid_access_token(&self, app: &str) -> Option<String> {
        let token_data = read_token_file(app)?;
        let token_data = if token_is_expired(&token_data, app) {
            match self.refresh_auth_token(None, app).await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    warn!(app, error = %e, "token refresh failed");
                    return None;
                }
            }
        } else {
            token_data
        };
        token_data
            .get("access_token")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
    }

    // ── Authenticated GET/POST with one silent 401 retry ─

    async fn schwab_get(
        &self,
        path: &str,
        params: Option<&[(String, String)]>,
        service: &str,
        app_type: &str,
    ) -> Option<serde_json::Value> {
        let app = normalize_app(app_type);
        let base = if service == "marketdata" {
            MARKETDATA_BASE_URL
        } else {
            TRADER_BASE_URL
        };
        let url = format!("{base}{path}");

        let mut retried_auth = false;
        loop {
            let token = match self.valid_access_token(app).await {
                Some(t) => t,
                None => {
                    self.ring.set_last_error(app, "No valid access token");
                    return None;
                }
            };
            let response = self
                .request_with_retry(
                    reqwest::Method::GET,
                    &url,
                    app,
                    path,
                    Some(&token),
                    None,
                    params,
                    RequestBody::None,
                )
                .await?;

            if response.status() == StatusCode::UNAUTHORIZED && !retried_auth {
                retried_auth = true;
                if self.refresh_auth_token(None, app).await.is_ok() {
                    continue;
                }
            }
            if response.status() != StatusCode::OK {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                self.ring
                    .set_last_error(app, format!("HTTP {status}: {}", truncate(&body, 300)));
                return None;
            }
            return match response.json::<serde_json::Value>().await {
                Ok(v) => Some(v),
                Err(_) => {
                    self.ring.set_last_error(app, "Failed to decode response JSON");
                    None
                }
            };
        }
    }

    async fn schwab_post(
        &self,
        path: &str,
        payload: &serde_json::Value,
        service: &str,
        app_type: &str,
    ) -> Option<serde_json::Value> {
        let app = normalize_app(app_type);
        let base = if service == "marketdata" {
            MARKETDATA_BASE_URL
        } else {
            TRADER_BASE_URL
        };
        let url = format!("{base}{path}");

        let mut retried_auth = false;
        loop {
            let token = match self.valid_access_token(app).await {
                Some(t) => t,
                None => {
                    self.ring.set_last_error(app, "No valid access token");
                    return None;
                }
            };
            let response = self
                .request_with_retry(
                    reqwest::Method::POST,
                    &url,
                    app,
                    path,
                    Some(&token),
                    None,
                    None,
                    RequestBody::Json(payload),
                )
                .await?;

            if response.status() == StatusCode::UNAUTHORIZED && !retried_auth {
                retried_auth = true;
                if self.refresh_auth_token(None, app).await.is_ok() {
                    continue;
                }
            }
            let status = response.status();
            if !matches!(
                status,
                StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED
            ) {
                let body = response.text().await.unwrap_or_default();
                self.ring.set_last_error(
                    app,
                    format!("HTTP {}: {}", status.as_u16(), truncate(&body, 300)),
                );
                return None;
            }
            let status_code = status.as_u16();
            return match response.json::<serde_json::Value>().await {
                Ok(v) => Some(v),
                // Order submissions can return empty bodies on 201.
                Err(_) => Some(serde_json::json!({ "status_code": status_code })),
            };
        }
    }

    // ── Market data ──────────────────────────────────────

    pub async fn get_quote(&self, symbol: &str) -> Option<Quote> {
        let sym = symbol.to_uppercase();
        let key = format!("quote:{sym}");
        cache_get_or_fetch(&key, "quote", || async {
            let data = self
                .schwab_get(
                    "/quotes",
                    Some(&[("symbols".to_string(), sym.clone())]),
                    "marketdata",
                    APP_MARKET,
                )
                .await?;
            extract_quote(&data, &sym)
        })
        .await
    }

    pub async fn get_multiple_quotes(&self, symbols: &[String]) -> HashMap<String, Quote> {
        let joined = symbols
            .iter()
            .map(|s| s.to_uppercase())
            .collect::<Vec<_>>()
            .join(",");
        let Some(data) = self
            .schwab_get(
                "/quotes",
                Some(&[("symbols".to_string(), joined)]),
                "marketdata",
                APP_MARKET,
            )
            .await
        else {
            return HashMap::new();
        };
        let mut out = HashMap::new();
        for symbol in symbols {
            let sym = symbol.to_uppercase();
            if let Some(q) = extract_quote(&data, &sym) {
                out.insert(sym, q);
            }
        }
        out
    }

    pub async fn get_price_history(
        &self,
        symbol: &str,
        period_type: &str,
        period: u32,
        frequency_type: &str,
        frequency: u32,
    ) -> Option<serde_json::Value> {
        let sym = symbol.to_uppercase();
        let key = format!("history:{sym}:{period_type}:{period}:{frequency_type}:{frequency}");
        cache_get_or_fetch(&key, "price_history", || async {
            let params = [
                ("symbol".to_string(), sym.clone()),
                ("periodType".to_string(), period_type.to_string()),
                ("period".to_string(), period.to_string()),
                ("frequencyType".to_string(), frequency_type.to_string()),
                ("frequency".to_string(), frequency.to_string()),
            ];
            let data = self
                .schwab_get("/pricehistory", Some(&params), "marketdata", APP_MARKET)
                .await?;
            let candles = data.get("candles")?.as_array()?;
            if candles.is_empty() {
                return None;
            }
            let converted: Vec<serde_json::Value> = candles
                .iter()
                .filter_map(|c| {
                    let ts = c.get("datetime")?.as_i64()?;
                    let dt = Utc.timestamp_millis_opt(ts).single()?;
                    Some(serde_json::json!({
                        "datetime": dt.to_rfc3339(),
                        "open": c.get("open"),
                        "high": c.get("high"),
                        "low": c.get("low"),
                        "close": c.get("close"),
                        "volume": c.get("volume"),
                    }))
                })
                .collect();
            Some(serde_json::json!({
                "symbol": sym,
                "candles": converted,
                "period_type": period_type,
                "period": period,
                "frequency_type": frequency_type,
                "frequency": frequency,
            }))
        })
        .await
    }

    pub async fn get_market_movers(&self, index: &str, sort: &str) -> Option<MoversReport> {
        let key = format!("movers:{index}:{sort}");
        cache_get_or_fetch(&key, "quote", || async {
            let data = self
                .schwab_get(
                    &format!("/movers/{index}"),
                    Some(&[("sort".to_string(), sort.to_string())]),
                    "marketdata",
                    APP_MARKET,
                )
                .await?;
            let screeners = data
                .get("screeners")
                .or_else(|| data.get("movers"))
                .and_then(|v| v.as_array())?;
            if screeners.is_empty() {
                return None;
            }
            let movers = screeners
                .iter()
                .take(10)
                .map(|m| {
                    let change = m.get("netChange").and_then(|v| v.as_f64());
                    Mover {
                        symbol: m
                            .get("symbol")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        description: m.get("description").and_then(|v| v.as_str()).map(String::from),
                        last_price: m.get("lastPrice").and_then(|v| v.as_f64()),
                        change,
                        direction: if change.unwrap_or(0.0) > 0.0 { "up" } else { "down" }.to_string(),
                        volume: m.get("volume").and_then(|v| v.as_i64()),
                        total_volume: m.get("totalVolume").and_then(|v| v.as_i64()),
                    }
                })
                .collect();
            Some(MoversReport {
                index: index.to_string(),
                sort: sort.to_string(),
                movers,
            })
        })
        .await
    }

    pub async fn get_market_hours(&self, markets: &[String]) -> Option<serde_json::Value> {
        let joined = if markets.is_empty() {
            "equity,option".to_string()
        } else {
            markets.join(",")
        };
        let data = self
            .schwab_get(
                "/markets",
                Some(&[("markets".to_string(), joined)]),
                "marketdata",
                APP_MARKET,
            )
            .await?;
        let mut formatted = serde_json::Map::new();
        for (market, products) in data.as_object()? {
            let mut product_map = serde_json::Map::new();
            if let Some(products) = products.as_object() {
                for (product, details) in products {
                    product_map.insert(
                        product.clone(),
                        serde_json::json!({
                            "date": details.get("date"),
                            "product_name": details.get("productName"),
                            "is_open": details.get("isOpen"),
                            "session_hours": details.get("sessionHours").cloned().unwrap_or(serde_json::json!({})),
                        }),
                    );
                }
            }
            formatted.insert(market.clone(), serde_json::Value::Object(product_map));
        }
        Some(serde_json::Value::Object(formatted))
    }

    // ── Trader ───────────────────────────────────────────

    pub async fn get_accounts(&self, include_positions: bool) -> Option<Vec<serde_json::Value>> {
        let params = include_positions.then(|| vec![("fields".to_string(), "positions".to_string())]);
        let raw = self
            .schwab_get("/accounts", params.as_deref(), "trader", APP_TRADER)
            .await?;
        match raw {
            serde_json::Value::Array(list) => Some(list),
            serde_json::Value::Object(_) => Some(
                raw.get("accounts")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_else(|| vec![raw.clone()]),
            ),
            _ => None,
        }
    }

    pub async fn get_account_orders(
        &self,
        account_number: &str,
        max_results: u32,
    ) -> Option<Vec<serde_json::Value>> {
        let raw = self
            .schwab_get(
                &format!("/accounts/{account_number}/orders"),
                Some(&[("maxResults".to_string(), max_results.to_string())]),
                "trader",
                APP_TRADER,
            )
            .await?;
        as_list(raw, "orders")
    }

    pub async fn get_all_orders(&self, max_results: u32) -> Option<Vec<serde_json::Value>> {
        let raw = self
            .schwab_get(
                "/orders",
                Some(&[("maxResults".to_string(), max_results.to_string())]),
                "trader",
                APP_TRADER,
            )
            .await?;
        as_list(raw, "orders")
    }

    pub async fn get_account_transactions(
        &self,
        account_number: &str,
        max_results: u32,
    ) -> Option<Vec<serde_json::Value>> {
        let raw = self
            .schwab_get(
                &format!("/accounts/{account_number}/transactions"),
                Some(&[("maxResults".to_string(), max_results.to_string())]),
                "trader",
                APP_TRADER,
            )
            .await?;
        as_list(raw, "transactions")
    }

    pub async fn get_user_preferences(&self) -> Option<serde_json::Value> {
        self.schwab_get("/userPreference", None, "trader", APP_TRADER).await
    }

    pub async fn preview_order(
        &self,
        account_number: &str,
        order: &serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.schwab_post(
            &format!("/accounts/{account_number}/previewOrder"),
            order,
            "trader",
            APP_TRADER,
        )
        .await
    }

    pub async fn place_order(
        &self,
        account_number: &str,
        order: &serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.schwab_post(
            &format!("/accounts/{account_number}/orders"),
            order,
            "trader",
            APP_TRADER,
        )
        .await
    }

    pub fn connection_status(&self) -> serde_json::Value {
        let app_status = |app: &str| {
            let (id, secret) = credentials(app);
            let path = token_path(app);
            serde_json::json!({
                "configured": !id.is_empty() && !secret.is_empty(),
                "token_exists": path.exists(),
                "client_ready": path.exists(),
                "redirect_uri": SETTINGS.schwab_redirect_uri,
                "token_path": path.display().to_string(),
                "client_id_suffix": id.chars().rev().take(4).collect::<String>().chars().rev().collect::<String>(),
                "last_error": self.ring.last_error(app),
            })
        };
        serde_json::json!({
            "market": app_status(APP_MARKET),
            "trader": app_status(APP_TRADER),
            "retry_policy": {
                "timeout_seconds": SETTINGS.schwab_http_timeout_seconds,
                "max_retries": SETTINGS.schwab_max_retries,
                "base_backoff_seconds": SETTINGS.schwab_retry_backoff_seconds,
            },
        })
    }
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn as_list(raw: serde_json::Value, key: &str) -> Option<Vec<serde_json::Value>> {
    match raw {
        serde_json::Value::Array(list) => Some(list),
        serde_json::Value::Object(ref map) => Some(
            map.get(key)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
        ),
        _ => None,
    }
}

fn extract_quote(data: &serde_json::Value, symbol: &str) -> Option<Quote> {
    let q = data.get(symbol)?.get("quote")?;
    let trade_time = q
        .get("tradeTime")
        .and_then(|v| v.as_i64())
        .and_then(|ts| Utc.timestamp_millis_opt(ts).single())
        .map(|dt| dt.to_rfc3339());
    Some(Quote {
        symbol: symbol.to_string(),
        price: q.get("lastPrice").and_then(|v| v.as_f64()),
        change: q.get("netChange").and_then(|v| v.as_f64()),
        percent_change: q.get("netPercentChange").and_then(|v| v.as_f64()),
        volume: q.get("totalVolume").and_then(|v| v.as_i64()),
        bid: q.get("bidPrice").and_then(|v| v.as_f64()),
        ask: q.get("askPrice").and_then(|v| v.as_f64()),
        open: q.get("openPrice").and_then(|v| v.as_f64()),
        close: q.get("closePrice").and_then(|v| v.as_f64()),
        high: q.get("highPrice").and_then(|v| v.as_f64()),
        low: q.get("lowPrice").and_then(|v| v.as_f64()),
        week_52_high: q.get("52WeekHigh").and_then(|v| v.as_f64()),
        week_52_low: q.get("52WeekLow").and_then(|v| v.as_f64()),
        pe_ratio: q.get("peRatio").and_then(|v| v.as_f64()),
        dividend_yield: q.get("divYield").and_then(|v| v.as_f64()),
        timestamp: trade_time,
        provider: "schwab".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_normalization_defaults_to_market() {
        assert_eq!(normalize_app("trader"), APP_TRADER);
        assert_eq!(normalize_app("TRADER"), APP_TRADER);
        assert_eq!(normalize_app("market"), APP_MARKET);
        assert_eq!(normalize_app("bogus"), APP_MARKET);
    }

    #[test]
    fn retry_delay_is_exponential_with_bounded_jitter() {
        let base = SETTINGS.schwab_retry_backoff_seconds.max(0.05);
        for attempt in 1..=3u32 {
            let d = retry_delay(attempt).as_secs_f64();
            let floor = base * 2f64.powi(attempt as i32 - 1);
            assert!(d >= floor, "attempt {attempt}: {d} < {floor}");
            assert!(d < floor + 0.1, "attempt {attempt}: {d} jitter too large");
        }
    }

    #[test]
    fn extract_quote_reads_schwab_shape() {
        let data = serde_json::json!({
            "AAPL": {
                "quote": {
                    "lastPrice": 212.5,
                    "netChange": 1.25,
                    "netPercentChange": 0.59,
                    "totalVolume": 40_000_000i64,
                    "bidPrice": 212.4,
                    "askPrice": 212.6,
                    "openPrice": 210.0,
                    "closePrice": 211.25,
                    "highPrice": 213.0,
                    "lowPrice": 209.5,
                    "52WeekHigh": 240.0,
                    "52WeekLow": 160.0,
                    "peRatio": 32.1,
                    "divYield": 0.5,
                    "tradeTime": 1_700_000_000_000i64,
                }
            }
        });
        let quote = extract_quote(&data, "AAPL").unwrap();
        assert_eq!(quote.symbol, "AAPL");
        assert_eq!(quote.price, Some(212.5));
        assert_eq!(quote.provider, "schwab");
        assert!(quote.timestamp.unwrap().starts_with("2023-11-14"));
        assert!(extract_quote(&data, "MSFT").is_none());
    }

    #[test]
    fn as_list_unwraps_both_shapes() {
        let arr = serde_json::json!([{"a": 1}]);
        assert_eq!(as_list(arr, "orders").unwrap().len(), 1);
        let wrapped = serde_json::json!({"orders": [{"a": 1}, {"a": 2}]});
        assert_eq!(as_list(wrapped, "orders").unwrap().len(), 2);
        let empty = serde_json::json!({"other": 1});
        assert!(as_list(empty, "orders").unwrap().is_empty());
    }
}
