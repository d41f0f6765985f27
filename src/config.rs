//! Central configuration loaded from the environment.
//!
//! One `Settings` value is built at startup (dotenv + env vars with defaults)
//! and shared as a process-wide static. Hot paths read fields directly; no
//! per-request env lookups.

use std::env;

use lazy_static::lazy_static;

lazy_static! {
    pub static ref SETTINGS: Settings = Settings::from_env();
}

#[derive(Debug, Clone)]
pub struct Settings {
    // LLM provider
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub routing_model: String,
    pub analysis_model: String,

    // Dual-app Schwab config
    pub schwab_market_client_id: String,
    pub schwab_market_client_secret: String,
    pub schwab_market_token_path: String,
    pub schwab_trader_client_id: String,
    pub schwab_trader_client_secret: String,
    pub schwab_trader_token_path: String,
    pub schwab_redirect_uri: String,
    pub schwab_http_timeout_seconds: f64,
    pub schwab_max_retries: u32,
    pub schwab_retry_backoff_seconds: f64,
    pub schwab_observability_buffer_size: usize,

    pub enable_live_trading: bool,
    pub require_hitl_for_trades: bool,
    pub hitl_shared_secret: String,

    pub market_data_provider: String,

    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,
    pub alpaca_paper: bool,
    pub tavily_api_key: String,
    pub reddit_client_id: String,
    pub reddit_client_secret: String,
    pub reddit_user_agent: String,
    pub fred_api_key: String,

    // Run tracker (local MLflow stand-in)
    pub tracker_enabled: bool,
    pub tracker_ui_url: String,

    // Storage
    pub database_path: String,
    pub qdrant_host: String,
    pub qdrant_port: u16,

    // Server
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub metrics_port: u16,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        // Legacy single-app credentials remain the fallback for both apps.
        let legacy_id = env_or("SCHWAB_CLIENT_ID", "");
        let legacy_secret = env_or("SCHWAB_CLIENT_SECRET", "");
        let legacy_token = env_or("SCHWAB_TOKEN_PATH", "/tmp/schwab_market_token.json");

        Self {
            llm_api_key: env_or("LLM_API_KEY", ""),
            llm_base_url: env_or("LLM_BASE_URL", "https://api.anthropic.com"),
            routing_model: env_or("ROUTING_MODEL", "claude-3-5-sonnet-latest"),
            analysis_model: env_or("ANALYSIS_MODEL", "claude-3-haiku-20240307"),

            schwab_market_client_id: env::var("SCHWAB_MARKET_CLIENT_ID")
                .unwrap_or_else(|_| legacy_id.clone()),
            schwab_market_client_secret: env::var("SCHWAB_MARKET_CLIENT_SECRET")
                .unwrap_or_else(|_| legacy_secret.clone()),
            schwab_market_token_path: env::var("SCHWAB_MARKET_TOKEN_PATH")
                .unwrap_or_else(|_| legacy_token.clone()),
            schwab_trader_client_id: env::var("SCHWAB_TRADER_CLIENT_ID")
                .unwrap_or_else(|_| legacy_id),
            schwab_trader_client_secret: env::var("SCHWAB_TRADER_CLIENT_SECRET")
                .unwrap_or_else(|_| legacy_secret),
            schwab_trader_token_path: env_or(
                "SCHWAB_TRADER_TOKEN_PATH",
                "/tmp/schwab_trader_token.json",
            ),
            schwab_redirect_uri: env_or("SCHWAB_REDIRECT_URI", "https://127.0.0.1:8182"),
            schwab_http_timeout_seconds: env_parse("SCHWAB_HTTP_TIMEOUT_SECONDS", 20.0),
            schwab_max_retries: env_parse("SCHWAB_MAX_RETRIES", 3),
            schwab_retry_backoff_seconds: env_parse("SCHWAB_RETRY_BACKOFF_SECONDS", 0.5),
            schwab_observability_buffer_size: env_parse("SCHWAB_OBSERVABILITY_BUFFER_SIZE", 200),

            enable_live_trading: env_bool("ENABLE_LIVE_TRADING", false),
            require_hitl_for_trades: env_bool("REQUIRE_HITL_FOR_TRADES", true),
            hitl_shared_secret: env_or("HITL_SHARED_SECRET", ""),

            market_data_provider: env_or("MARKET_DATA_PROVIDER", "auto").to_lowercase(),

            alpaca_api_key: env_or("ALPACA_API_KEY", ""),
            alpaca_secret_key: env_or("ALPACA_SECRET_KEY", ""),
            alpaca_paper: env_bool("ALPACA_PAPER", true),
            tavily_api_key: env_or("TAVILY_API_KEY", ""),
            reddit_client_id: env_or("REDDIT_CLIENT_ID", ""),
            reddit_client_secret: env_or("REDDIT_CLIENT_SECRET", ""),
            reddit_user_agent: env_or("REDDIT_USER_AGENT", "StockPilot/0.1"),
            fred_api_key: env_or("FRED_API_KEY", ""),

            tracker_enabled: env_bool("TRACKER_ENABLED", true),
            tracker_ui_url: env_or("TRACKER_UI_URL", "http://127.0.0.1:5001"),

            database_path: env_or("DATABASE_PATH", "./stockpilot.db"),
            qdrant_host: env_or("QDRANT_HOST", "localhost"),
            qdrant_port: env_parse("QDRANT_PORT", 6333),

            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8001),
            allowed_origins: env_or(
                "ALLOWED_ORIGINS",
                "http://localhost:3000,http://localhost:3001,http://127.0.0.1:3000,http://127.0.0.1:3001",
            )
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect(),
            metrics_port: env_parse("METRICS_PORT", 9102),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::from_env();
        assert_eq!(s.schwab_max_retries.max(1), s.schwab_max_retries);
        assert!(s.schwab_http_timeout_seconds > 0.0);
        assert!(!s.allowed_origins.is_empty());
        assert!(["auto", "schwab", "alpaca"].contains(&s.market_data_provider.as_str())
            || !s.market_data_provider.is_empty());
    }

    #[test]
    fn env_bool_parses_truthy_values() {
        std::env::set_var("STOCKPILOT_TEST_FLAG", "TRUE");
        assert!(env_bool("STOCKPILOT_TEST_FLAG", false));
        std::env::set_var("STOCKPILOT_TEST_FLAG", "0");
        assert!(!env_bool("STOCKPILOT_TEST_FLAG", true));
        std::env::remove_var("STOCKPILOT_TEST_FLAG");
    }
}
