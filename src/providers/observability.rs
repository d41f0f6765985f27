//! Bounded ring of broker API events with asynchronous audit persistence.
//!
//! Append order is preserved; the ring holds the most recent N events while
//! every event is also written to `broker_api_events` on a background task.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{broker_repo, Database};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerEvent {
    pub timestamp: String,
    pub provider: String,
    pub app_type: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub attempt: u32,
    pub latency_ms: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservabilitySnapshot {
    pub buffer_size: usize,
    pub event_count: u64,
    pub recent_events: Vec<BrokerEvent>,
    pub counters: Vec<(String, u64)>,
    pub last_errors: HashMap<String, Option<String>>,
}

pub struct BrokerEventRing {
    capacity: usize,
    events: Mutex<VecDeque<BrokerEvent>>,
    total: Mutex<u64>,
    counters: Mutex<HashMap<String, u64>>,
    last_errors: Mutex<HashMap<String, Option<String>>>,
    db: Option<Database>,
}

impl BrokerEventRing {
    pub fn new(capacity: usize, db: Option<Database>) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            total: Mutex::new(0),
            counters: Mutex::new(HashMap::new()),
            last_errors: Mutex::new(HashMap::new()),
            db,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        self: &Arc<Self>,
        provider: &str,
        app_type: &str,
        endpoint: &str,
        method: &str,
        status_code: Option<u16>,
        attempt: u32,
        latency_ms: Option<u64>,
        success: bool,
        error: Option<String>,
        request_id: Option<String>,
    ) {
        let event = BrokerEvent {
            timestamp: Utc::now().to_rfc3339(),
            provider: provider.to_string(),
            app_type: app_type.to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            status_code,
            attempt,
            latency_ms,
            success,
            error: error.clone(),
            request_id: request_id.clone(),
        };

        {
            let mut events = self.events.lock();
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
        *self.total.lock() += 1;

        let counter_key = format!(
            "{app_type}:{method}:{endpoint}:{}",
            status_code.map(|s| s.to_string()).unwrap_or_else(|| "ERR".into())
        );
        *self.counters.lock().entry(counter_key).or_insert(0) += 1;

        {
            let mut last = self.last_errors.lock();
            if let Some(ref err) = error {
                last.insert(app_type.to_string(), Some(err.clone()));
            } else if success {
                last.insert(app_type.to_string(), None);
            }
        }

        metrics::increment_counter!(
            "broker_api_attempts_total",
            "provider" => provider.to_string(),
            "app" => app_type.to_string(),
            "success" => success.to_string()
        );
        if let Some(latency) = latency_ms {
            metrics::histogram!(
                "broker_api_latency_ms",
                latency as f64,
                "provider" => provider.to_string(),
                "app" => app_type.to_string()
            );
        }

        if let Some(db) = self.db.clone() {
            let provider = provider.to_string();
            tokio::spawn(async move {
                let outcome = broker_repo::log_broker_event(
                    &db,
                    &provider,
                    &event.app_type,
                    &event.endpoint,
                    &event.method,
                    event.status_code,
                    event.attempt,
                    event.latency_ms,
                    event.success,
                    event.error.as_deref(),
                    event.request_id.as_deref(),
                    &serde_json::json!({}),
                );
                if let Err(e) = outcome {
                    debug!(error = %e, "failed to persist broker event");
                }
            });
        }
    }

    pub fn last_error(&self, app_type: &str) -> Option<String> {
        self.last_errors.lock().get(app_type).cloned().flatten()
    }

    pub fn set_last_error(&self, app_type: &str, error: impl Into<String>) {
        self.last_errors
            .lock()
            .insert(app_type.to_string(), Some(error.into()));
    }

    pub fn clear_last_error(&self, app_type: &str) {
        self.last_errors.lock().insert(app_type.to_string(), None);
    }

    pub fn snapshot(&self, limit: usize) -> ObservabilitySnapshot {
        let events = self.events.lock();
        let take = limit.clamp(1, self.capacity);
        let recent: Vec<BrokerEvent> = events
            .iter()
            .rev()
            .take(take)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let mut counters: Vec<(String, u64)> = self
            .counters
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        counters.sort();
        ObservabilitySnapshot {
            buffer_size: self.capacity,
            event_count: *self.total.lock(),
            recent_events: recent,
            counters,
            last_errors: self.last_errors.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_n(ring: &Arc<BrokerEventRing>, n: usize, success: bool) {
        for i in 0..n {
            ring.record(
                "schwab",
                "market",
                "/quotes",
                "GET",
                Some(if success { 200 } else { 503 }),
                1,
                Some(10 + i as u64),
                success,
                if success { None } else { Some("HTTP 503".into()) },
                None,
            );
        }
    }

    #[tokio::test]
    async fn ring_is_bounded_and_ordered() {
        let ring = BrokerEventRing::new(3, None);
        record_n(&ring, 5, true);
        let snap = ring.snapshot(10);
        assert_eq!(snap.event_count, 5);
        assert_eq!(snap.recent_events.len(), 3);
        // Oldest events were evicted; latencies 12, 13, 14 remain in order.
        let latencies: Vec<u64> = snap.recent_events.iter().filter_map(|e| e.latency_ms).collect();
        assert_eq!(latencies, vec![12, 13, 14]);
    }

    #[tokio::test]
    async fn last_error_tracks_per_app() {
        let ring = BrokerEventRing::new(8, None);
        record_n(&ring, 1, false);
        assert_eq!(ring.last_error("market").as_deref(), Some("HTTP 503"));
        record_n(&ring, 1, true);
        assert_eq!(ring.last_error("market"), None);
        assert_eq!(ring.last_error("trader"), None);
    }

    #[tokio::test]
    async fn counters_aggregate_by_status() {
        let ring = BrokerEventRing::new(8, None);
        record_n(&ring, 2, true);
        record_n(&ring, 1, false);
        let snap = ring.snapshot(8);
        let by_key: HashMap<_, _> = snap.counters.into_iter().collect();
        assert_eq!(by_key.get("market:GET:/quotes:200"), Some(&2));
        assert_eq!(by_key.get("market:GET:/quotes:503"), Some(&1));
    }
}
