//! FRED client for macroeconomic data.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::cache_get_or_fetch;
use crate::config::SETTINGS;

const FRED_BASE_URL: &str = "https://api.stlouisfed.org/fred";

/// Human names accepted in place of raw series ids.
fn map_series_id(series_id: &str) -> String {
    match series_id.to_lowercase().as_str() {
        "gdp" => "GDP",
        "cpi" => "CPIAUCSL",
        "unemployment" => "UNRATE",
        "fed_funds" => "FEDFUNDS",
        "10y_treasury" => "DGS10",
        "2y_treasury" => "DGS2",
        "sp500" => "SP500",
        _ => return series_id.to_string(),
    }
    .to_string()
}

// Hardcoded metadata for the well-known series avoids a second HTTP call
// to /fred/series per indicator.
fn known_metadata(series_id: &str) -> Option<(&'static str, &'static str)> {
    match series_id {
        "GDP" => Some(("Gross Domestic Product", "Billions of Dollars")),
        "CPIAUCSL" => Some((
            "Consumer Price Index for All Urban Consumers",
            "Index 1982-1984=100",
        )),
        "UNRATE" => Some(("Unemployment Rate", "Percent")),
        "FEDFUNDS" => Some(("Federal Funds Effective Rate", "Percent")),
        "DGS10" => Some(("10-Year Treasury Constant Maturity Rate", "Percent")),
        "DGS2" => Some(("2-Year Treasury Constant Maturity Rate", "Percent")),
        "SP500" => Some(("S&P 500", "Index")),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesObservation {
    pub date: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesData {
    pub series_id: String,
    pub title: String,
    pub units: String,
    pub observations: Vec<SeriesObservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSearchHit {
    pub id: String,
    pub title: String,
    pub frequency: String,
    pub units: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub value: Option<f64>,
    pub date: String,
    pub title: String,
    pub units: String,
}

pub struct FredClient {
    http: reqwest::Client,
}

impl FredClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    async fn fetch(&self, endpoint: &str, params: &[(String, String)]) -> Option<serde_json::Value> {
        if SETTINGS.fred_api_key.is_empty() {
            warn!("FRED_API_KEY is not set");
            return None;
        }
        let mut query = params.to_vec();
        query.push(("api_key".to_string(), SETTINGS.fred_api_key.clone()));
        query.push(("file_type".to_string(), "json".to_string()));
        let url = format!("{FRED_BASE_URL}/{endpoint}");
        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| warn!(endpoint, error = %e, "FRED request failed"))
            .ok()?;
        if !response.status().is_success() {
            warn!(endpoint, status = response.status().as_u16(), "FRED API error");
            return None;
        }
        response.json().await.ok()
    }

    pub async fn get_series_data(&self, series_id: &str, limit: usize) -> Option<SeriesData> {
        let id = map_series_id(series_id);
        let key = format!("fred:series:{id}:{limit}");
        cache_get_or_fetch(&key, "economic_data", || async {
            let data = self
                .fetch(
                    "series/observations",
                    &[
                        ("series_id".to_string(), id.clone()),
                        ("sort_order".to_string(), "desc".to_string()),
                        ("limit".to_string(), limit.to_string()),
                    ],
                )
                .await?;
            let observations = data.get("observations")?.as_array()?;

            let (title, units) = if let Some((t, u)) = known_metadata(&id) {
                (t.to_string(), u.to_string())
            } else {
                let info = self
                    .fetch("series", &[("series_id".to_string(), id.clone())])
                    .await;
                let series = info
                    .as_ref()
                    .and_then(|i| i.get("seriess"))
                    .and_then(|s| s.as_array())
                    .and_then(|s| s.first());
                (
                    series
                        .and_then(|s| s.get("title"))
                        .and_then(|v| v.as_str())
                        .unwrap_or(&id)
                        .to_string(),
                    series
                        .and_then(|s| s.get("units"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                )
            };

            Some(SeriesData {
                series_id: id.clone(),
                title,
                units,
                observations: observations
                    .iter()
                    .filter_map(|obs| {
                        let raw = obs.get("value")?.as_str()?;
                        Some(SeriesObservation {
                            date: obs.get("date")?.as_str()?.to_string(),
                            value: if raw == "." { None } else { raw.parse().ok() },
                        })
                    })
                    .collect(),
            })
        })
        .await
    }

    pub async fn search_series(&self, query: &str, limit: usize) -> Option<Vec<SeriesSearchHit>> {
        let key = format!("fred:search:{query}");
        cache_get_or_fetch(&key, "economic_data", || async {
            let data = self
                .fetch(
                    "series/search",
                    &[
                        ("search_text".to_string(), query.to_string()),
                        ("limit".to_string(), limit.to_string()),
                    ],
                )
                .await?;
            let series = data.get("seriess")?.as_array()?;
            Some(
                series
                    .iter()
                    .filter_map(|s| {
                        Some(SeriesSearchHit {
                            id: s.get("id")?.as_str()?.to_string(),
                            title: s.get("title")?.as_str()?.to_string(),
                            frequency: s
                                .get("frequency")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            units: s.get("units").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        })
                    })
                    .collect(),
            )
        })
        .await
    }

    /// Summary of the key indicators, fetched concurrently with a hard cap.
    pub async fn get_key_indicators(&self) -> HashMap<String, IndicatorSnapshot> {
        let indicators = ["gdp", "cpi", "unemployment", "fed_funds", "10y_treasury"];
        let fetches = indicators.iter().map(|name| self.get_series_data(name, 1));
        let results = match tokio::time::timeout(Duration::from_secs(10), join_all(fetches)).await {
            Ok(results) => results,
            Err(_) => {
                warn!("FRED indicators fetch timed out");
                return HashMap::new();
            }
        };

        let mut summary = HashMap::new();
        for (name, result) in indicators.iter().zip(results) {
            if let Some(series) = result {
                if let Some(latest) = series.observations.first() {
                    summary.insert(
                        name.to_string(),
                        IndicatorSnapshot {
                            value: latest.value,
                            date: latest.date.clone(),
                            title: series.title.clone(),
                            units: series.units.clone(),
                        },
                    );
                }
            }
        }
        summary
    }
}

impl Default for FredClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_aliases_map_to_ids() {
        assert_eq!(map_series_id("gdp"), "GDP");
        assert_eq!(map_series_id("10y_treasury"), "DGS10");
        assert_eq!(map_series_id("DGS10"), "DGS10");
        assert_eq!(map_series_id("HOUST"), "HOUST");
    }

    #[test]
    fn known_metadata_covers_the_seven() {
        for id in ["GDP", "CPIAUCSL", "UNRATE", "FEDFUNDS", "DGS10", "DGS2", "SP500"] {
            assert!(known_metadata(id).is_some(), "{id} missing metadata");
        }
        assert!(known_metadata("HOUST").is_none());
    }
}
