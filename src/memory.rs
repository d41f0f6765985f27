//! Vector-backed conversational memory (Qdrant REST).
//!
//! Embeddings are deterministic 384-d hashed character trigrams so the memory
//! path is fully testable offline; the wire shape matches a real embedder, so
//! swapping one in only touches `embed`.

use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SETTINGS;
use crate::models::MemorySnippet;

pub const COLLECTION_NAME: &str = "conversation_memory";
pub const EMBEDDING_DIM: usize = 384;

const USER_INPUT_LIMIT: usize = 500;
const AGENT_OUTPUT_LIMIT: usize = 1800;

/// Deterministic trigram-hash embedding, L2-normalized.
pub fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0f32; EMBEDDING_DIM];
    let normalized: String = text.to_lowercase();
    let chars: Vec<char> = normalized.chars().collect();
    if chars.is_empty() {
        return vector;
    }
    for window in chars.windows(3.min(chars.len())) {
        let gram: String = window.iter().collect();
        let digest = Sha256::digest(gram.as_bytes());
        let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
            % EMBEDDING_DIM;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(limit).collect();
    format!("{cut}...")
}

pub struct MemoryManager {
    http: reqwest::Client,
    base_url: String,
}

impl MemoryManager {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: format!("http://{}:{}", SETTINGS.qdrant_host, SETTINGS.qdrant_port),
        }
    }

    /// Create the collection if missing. Failures are logged, not fatal:
    /// memory degrades to empty recalls.
    pub async fn ensure_collection(&self) {
        let url = format!("{}/collections/{COLLECTION_NAME}", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => return,
            Ok(_) | Err(_) => {}
        }
        let body = serde_json::json!({
            "vectors": { "size": EMBEDDING_DIM, "distance": "Cosine" }
        });
        match self.http.put(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(collection = COLLECTION_NAME, "created memory collection");
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "failed to create memory collection")
            }
            Err(e) => warn!(error = %e, "memory store unreachable"),
        }
    }

    /// Persist one exchange. User text is capped at 500 chars and agent text
    /// at 1800 to keep retrieval token overhead bounded.
    pub async fn save_interaction(&self, user_input: &str, agent_output: &str, metadata: &Value) {
        let content = format!(
            "User: {}\nAssistant: {}",
            truncate(user_input, USER_INPUT_LIMIT),
            truncate(agent_output, AGENT_OUTPUT_LIMIT)
        );
        let mut payload = serde_json::Map::new();
        payload.insert("page_content".to_string(), Value::String(content.clone()));
        if let Some(meta) = metadata.as_object() {
            for (k, v) in meta {
                if !v.is_null() {
                    payload.insert(k.clone(), v.clone());
                }
            }
        }

        let body = serde_json::json!({
            "points": [{
                "id": Uuid::new_v4().to_string(),
                "vector": embed(&content),
                "payload": payload,
            }]
        });
        let url = format!("{}/collections/{COLLECTION_NAME}/points?wait=false", self.base_url);
        match self.http.put(&url).json(&body).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(status = response.status().as_u16(), "memory save rejected")
            }
            Err(e) => warn!(error = %e, "memory save failed"),
            _ => {}
        }
    }

    async fn search(&self, query: &str, k: usize, filter: &[(String, String)]) -> Vec<MemorySnippet> {
        let mut body = serde_json::json!({
            "vector": embed(query),
            "limit": k,
            "with_payload": true,
        });
        if !filter.is_empty() {
            let must: Vec<Value> = filter
                .iter()
                .map(|(key, value)| {
                    serde_json::json!({ "key": key, "match": { "value": value } })
                })
                .collect();
            body["filter"] = serde_json::json!({ "must": must });
        }

        let url = format!("{}/collections/{COLLECTION_NAME}/points/search", self.base_url);
        let response = match self.http.post(&url).json(&body).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = r.status().as_u16(), "memory search rejected");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "memory search failed");
                return Vec::new();
            }
        };
        let Ok(data) = response.json::<Value>().await else {
            return Vec::new();
        };
        data.get("result")
            .and_then(|v| v.as_array())
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| {
                        let mut payload = hit.get("payload")?.as_object()?.clone();
                        let content = payload
                            .remove("page_content")
                            .and_then(|v| v.as_str().map(String::from))
                            .unwrap_or_default();
                        Some(MemorySnippet {
                            content,
                            metadata: Value::Object(payload),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Scoped similarity search. The strictest available filter is applied
    /// first; an empty thread-scoped result retries once with the
    /// conversation filter dropped. Tenant/user scope is never widened.
    pub async fn get_relevant_context(
        &self,
        query: &str,
        k: usize,
        tenant_id: Option<&str>,
        user_id: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Vec<MemorySnippet> {
        let filter = scope_filter(tenant_id, user_id, conversation_id);
        if filter.is_empty() {
            return Vec::new();
        }
        let had_conversation = filter.iter().any(|(key, _)| key == "conversation_id");

        let hits = self.search(query, k, &filter).await;
        if !hits.is_empty() || !had_conversation {
            return hits;
        }
        let broader = widen_filter(filter);
        if broader.is_empty() {
            return Vec::new();
        }
        self.search(query, k, &broader).await
    }
}

/// Build the strictest filter available from the provided scope ids.
fn scope_filter(
    tenant_id: Option<&str>,
    user_id: Option<&str>,
    conversation_id: Option<&str>,
) -> Vec<(String, String)> {
    let mut filter = Vec::new();
    if let Some(tenant) = tenant_id.filter(|t| !t.is_empty()) {
        filter.push(("tenant_id".to_string(), tenant.to_string()));
    }
    if let Some(user) = user_id.filter(|u| !u.is_empty()) {
        filter.push(("user_id".to_string(), user.to_string()));
    }
    if let Some(conversation) = conversation_id.filter(|c| !c.is_empty()) {
        filter.push(("conversation_id".to_string(), conversation.to_string()));
    }
    filter
}

/// Drop only the conversation scope; tenant and user conditions survive.
fn widen_filter(filter: Vec<(String, String)>) -> Vec<(String, String)> {
    filter
        .into_iter()
        .filter(|(key, _)| key != "conversation_id")
        .collect()
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let a = embed("Why did TSLA drop this past week?");
        let b = embed("Why did TSLA drop this past week?");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn embedding_distinguishes_texts() {
        let a = embed("dividend safety for utilities");
        let b = embed("semiconductor momentum breakout");
        let dot: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!(dot < 0.9, "unrelated texts should not be near-identical: {dot}");
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let v = embed("");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn scope_filter_keeps_tenant_on_widening() {
        let filter = scope_filter(Some("tenant-a"), Some("user-1"), Some("conv-9"));
        assert_eq!(filter.len(), 3);
        let widened = widen_filter(filter);
        assert_eq!(widened.len(), 2);
        assert!(widened.iter().any(|(k, v)| k == "tenant_id" && v == "tenant-a"));
        assert!(widened.iter().any(|(k, v)| k == "user_id" && v == "user-1"));
        assert!(!widened.iter().any(|(k, _)| k == "conversation_id"));
    }

    #[test]
    fn scope_filter_skips_empty_ids() {
        assert!(scope_filter(None, None, None).is_empty());
        let filter = scope_filter(Some(""), Some("user-1"), None);
        assert_eq!(filter.len(), 1);
        assert_eq!(filter[0].0, "user_id");
    }

    #[test]
    fn truncation_limits() {
        let long = "x".repeat(600);
        let out = truncate(&long, USER_INPUT_LIMIT);
        assert_eq!(out.chars().count(), USER_INPUT_LIMIT + 3);
        assert!(out.ends_with("..."));
        assert_eq!(truncate("short", USER_INPUT_LIMIT), "short");
    }
}
