//! Process-wide shared handles, built once at startup.

use std::sync::Arc;

use anyhow::Result;

use crate::config::SETTINGS;
use crate::db::Database;
use crate::llm::LlmClient;
use crate::market_data::MarketData;
use crate::memory::MemoryManager;
use crate::providers::alpaca::AlpacaClient;
use crate::providers::finviz::FinvizClient;
use crate::providers::fred::FredClient;
use crate::providers::observability::BrokerEventRing;
use crate::providers::reddit::RedditClient;
use crate::providers::schwab::SchwabClient;
use crate::providers::tavily::TavilyClient;
use crate::tracker::Tracker;

pub struct AppDeps {
    pub db: Database,
    pub ring: Arc<BrokerEventRing>,
    pub schwab: Arc<SchwabClient>,
    pub alpaca: Arc<AlpacaClient>,
    pub finviz: Arc<FinvizClient>,
    pub fred: Arc<FredClient>,
    pub reddit: Arc<RedditClient>,
    pub tavily: Arc<TavilyClient>,
    pub market: Arc<MarketData>,
    pub llm: Arc<LlmClient>,
    pub memory: Arc<MemoryManager>,
    pub tracker: Arc<Tracker>,
}

impl AppDeps {
    pub fn build(db: Database) -> Result<Arc<Self>> {
        let ring = BrokerEventRing::new(SETTINGS.schwab_observability_buffer_size, Some(db.clone()));
        let schwab = Arc::new(SchwabClient::new(ring.clone()));
        let alpaca = Arc::new(AlpacaClient::new());
        let finviz = Arc::new(FinvizClient::new());
        let market = Arc::new(MarketData::new(schwab.clone(), alpaca.clone(), finviz.clone()));
        let tracker = Arc::new(Tracker::new(db.clone()));
        Ok(Arc::new(Self {
            db,
            ring,
            schwab,
            alpaca,
            finviz,
            fred: Arc::new(FredClient::new()),
            reddit: Arc::new(RedditClient::new()),
            tavily: Arc::new(TavilyClient::new()),
            market,
            llm: Arc::new(LlmClient::new()),
            memory: Arc::new(MemoryManager::new()),
            tracker,
        }))
    }

    /// Test fixture over an in-memory database.
    pub fn for_tests() -> Arc<Self> {
        Self::build(Database::open_in_memory().expect("in-memory db")).expect("deps")
    }
}
